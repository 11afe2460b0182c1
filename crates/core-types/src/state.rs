use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::CommandStatus;
use crate::error::ErrorCode;
use crate::settings::Settings;

/// Reply returned synchronously by `enqueue`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionVerdict {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl AdmissionVerdict {
    pub fn queued() -> Self {
        Self {
            status: CommandStatus::Queued,
            error: None,
        }
    }

    pub fn rejected(code: ErrorCode) -> Self {
        Self {
            status: CommandStatus::Rejected,
            error: Some(code),
        }
    }
}

/// Terminal result of an executed command or sub-action. Handler-specific
/// fields (tabId, records, itemsStreamed, …) travel in the flattened map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl CommandOutcome {
    pub fn completed() -> Self {
        Self {
            status: CommandStatus::Completed,
            error_code: None,
            data: Map::new(),
        }
    }

    pub fn completed_with(data: Map<String, Value>) -> Self {
        Self {
            status: CommandStatus::Completed,
            error_code: None,
            data,
        }
    }

    pub fn failed(code: ErrorCode) -> Self {
        Self {
            status: CommandStatus::Failed,
            error_code: Some(code.as_str().to_string()),
            data: Map::new(),
        }
    }

    /// Free-form error code for unexpected failures.
    pub fn failed_message(code: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            error_code: Some(code.into()),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == CommandStatus::Completed
    }
}

/// One line of the bounded execution log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, status: CommandStatus) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status,
            error_code: None,
            timestamp: Utc::now().to_rfc3339(),
            url: None,
        }
    }

    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Compact per-command summary kept in the result store. Bulky handler
/// payloads (record lists) are not retained here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub command_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultSummary {
    pub fn from_outcome(kind: impl Into<String>, outcome: &CommandOutcome) -> Self {
        let mut extra = outcome.data.clone();
        extra.remove("records");
        Self {
            status: outcome.status,
            error_code: outcome.error_code.clone(),
            command_type: kind.into(),
            extra,
        }
    }
}

/// Connection state of an outbound transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BridgeStatus::Connecting => "connecting",
            BridgeStatus::Connected => "connected",
            BridgeStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// What a capture session is harvesting for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Listings,
    Reviews,
}

impl CaptureMode {
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "listings" => Some(CaptureMode::Listings),
            "reviews" => Some(CaptureMode::Reviews),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Listings => "listings",
            CaptureMode::Reviews => "reviews",
        }
    }
}

/// One record produced from a buffered response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRecord {
    pub source: String,
    pub url: String,
    pub capture_type: CaptureMode,
    pub json: Value,
}

/// Snapshot broadcast to the agent and returned by `getExtensionState`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionState {
    pub settings: Settings,
    pub queue_length: usize,
    pub processing: bool,
    /// Most recent log entries, capped at 20 on the wire.
    pub logs: Vec<LogEntry>,
    pub bridge_status: BridgeStatus,
}
