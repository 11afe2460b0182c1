use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, ErrorCode};

/// The verbs the executor understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    OpenUrl,
    Wait,
    ScrollToBottom,
    Click,
    CaptureJsonFromDevtools,
    ExtractSchema,
    ExecuteSearchTask,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::OpenUrl => "OPEN_URL",
            CommandType::Wait => "WAIT",
            CommandType::ScrollToBottom => "SCROLL_TO_BOTTOM",
            CommandType::Click => "CLICK",
            CommandType::CaptureJsonFromDevtools => "CAPTURE_JSON_FROM_DEVTOOLS",
            CommandType::ExtractSchema => "EXTRACT_SCHEMA",
            CommandType::ExecuteSearchTask => "EXECUTE_SEARCH_TASK",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a command or sub-action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Rejected,
    Completed,
    Failed,
}

/// A follow-up step executed against the parent command's tab.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandAction {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Unit of work submitted by the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Top-level `actions` is accepted as a fallback; `payload.actions` wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<CommandAction>>,
}

impl Command {
    pub fn new(id: impl Into<String>, kind: CommandType) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Map::new(),
            actions: None,
        }
    }

    /// Validate a raw wire value into a command. Missing or malformed `id`,
    /// `type` or `actions` entries fail with `INVALID_COMMAND`.
    pub fn parse(value: &Value) -> Result<Command, CoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::new(ErrorCode::InvalidCommand, "command must be an object"))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                CoreError::new(ErrorCode::InvalidCommand, "command requires a non-empty 'id'")
            })?;

        let kind_value = obj
            .get("type")
            .ok_or_else(|| CoreError::new(ErrorCode::InvalidCommand, "command requires a 'type'"))?;
        let kind: CommandType = serde_json::from_value(kind_value.clone()).map_err(|_| {
            CoreError::new(
                ErrorCode::InvalidCommand,
                format!("unknown command type {kind_value}"),
            )
        })?;

        let payload = match obj.get("payload") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(CoreError::new(
                    ErrorCode::InvalidCommand,
                    "command payload must be an object",
                ))
            }
        };

        let actions = match obj.get("actions") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_actions(value)?),
        };

        Ok(Command {
            id: id.to_string(),
            kind,
            payload,
            actions,
        })
    }

    /// Sub-actions to run after the primary effect, `payload.actions` first.
    pub fn sub_actions(&self) -> Result<Vec<CommandAction>, CoreError> {
        if let Some(value) = self.payload.get("actions") {
            if !value.is_null() {
                return parse_actions(value);
            }
        }
        Ok(self.actions.clone().unwrap_or_default())
    }

    pub fn url(&self) -> Option<&str> {
        str_field(&self.payload, "url")
    }
}

fn parse_actions(value: &Value) -> Result<Vec<CommandAction>, CoreError> {
    let entries = value
        .as_array()
        .ok_or_else(|| CoreError::new(ErrorCode::InvalidCommand, "'actions' must be a list"))?;
    entries
        .iter()
        .map(|entry| {
            serde_json::from_value::<CommandAction>(entry.clone()).map_err(|err| {
                CoreError::new(ErrorCode::InvalidCommand, format!("bad action entry: {err}"))
            })
        })
        .collect()
}

pub fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

pub fn u64_field(payload: &Map<String, Value>, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

pub fn bool_field(payload: &Map<String, Value>, key: &str) -> Option<bool> {
    payload.get(key).and_then(Value::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_requires_id_and_type() {
        let missing_id = json!({"type": "WAIT"});
        let err = Command::parse(&missing_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCommand);

        let blank_id = json!({"id": "  ", "type": "WAIT"});
        assert!(Command::parse(&blank_id).is_err());

        let unknown = json!({"id": "a", "type": "TELEPORT"});
        let err = Command::parse(&unknown).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCommand);
    }

    #[test]
    fn parse_reads_payload_and_nested_actions() {
        let value = json!({
            "id": "cmd-1",
            "type": "OPEN_URL",
            "payload": {
                "url": "https://etsy.com/search?q=lamp",
                "actions": [
                    {"type": "WAIT", "payload": {"milliseconds": 50}},
                    {"type": "SCROLL_TO_BOTTOM"}
                ]
            }
        });
        let command = Command::parse(&value).unwrap();
        assert_eq!(command.kind, CommandType::OpenUrl);
        assert_eq!(command.url(), Some("https://etsy.com/search?q=lamp"));
        let actions = command.sub_actions().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, CommandType::Wait);
        assert_eq!(u64_field(&actions[0].payload, "milliseconds"), Some(50));
    }

    #[test]
    fn payload_actions_win_over_top_level() {
        let value = json!({
            "id": "cmd-2",
            "type": "OPEN_URL",
            "payload": {"url": "https://etsy.com/", "actions": [{"type": "WAIT"}]},
            "actions": [{"type": "CLICK"}, {"type": "CLICK"}]
        });
        let command = Command::parse(&value).unwrap();
        let actions = command.sub_actions().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, CommandType::Wait);
    }

    #[test]
    fn verb_wire_form_is_screaming_snake() {
        let json = serde_json::to_string(&CommandType::CaptureJsonFromDevtools).unwrap();
        assert_eq!(json, "\"CAPTURE_JSON_FROM_DEVTOOLS\"");
    }
}
