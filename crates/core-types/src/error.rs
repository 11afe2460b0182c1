use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal error taxonomy surfaced in results, logs and wire frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DomainNotAllowed,
    AttachFailed,
    ParsingError,
    InvalidCommand,
    RateLimited,
    NavigationTimeout,
    ContentScriptError,
    AgentDisabled,
    UnknownMessageType,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DomainNotAllowed => "DOMAIN_NOT_ALLOWED",
            ErrorCode::AttachFailed => "ATTACH_FAILED",
            ErrorCode::ParsingError => "PARSING_ERROR",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NavigationTimeout => "NAVIGATION_TIMEOUT",
            ErrorCode::ContentScriptError => "CONTENT_SCRIPT_ERROR",
            ErrorCode::AgentDisabled => "AGENT_DISABLED",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared error type carried between the tabpilot crates.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.as_str().to_string(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }
}
