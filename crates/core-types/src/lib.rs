//! Shared vocabulary for the tabpilot crates: command and result shapes,
//! the error taxonomy, runtime settings and the wire-level state snapshot.

pub mod backoff;
pub mod command;
pub mod error;
pub mod settings;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use command::{Command, CommandAction, CommandStatus, CommandType};
pub use error::{CoreError, ErrorCode};
pub use settings::Settings;
pub use state::{
    AdmissionVerdict, BridgeStatus, CaptureMode, CapturedRecord, CommandOutcome, ExtensionState,
    LogEntry, ResultSummary,
};

/// Identifier of a browser tab, as assigned by the browser (CDP target id).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TabId(pub String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a command id in the shape the agent side uses for ad-hoc work.
pub fn generated_command_id() -> String {
    format!("agent-{}", uuid::Uuid::new_v4())
}
