use thiserror::Error;

/// Errors surfaced by the browser driver.
#[derive(Clone, Debug, Error)]
pub enum DriverError {
    #[error("cdp i/o error: {0}")]
    Io(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("debugger attach failed: {0}")]
    Attach(String),
    #[error("unknown tab {0}")]
    UnknownTab(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    pub fn io(err: impl ToString) -> Self {
        Self::Io(err.to_string())
    }

    pub fn protocol(err: impl ToString) -> Self {
        Self::Protocol(err.to_string())
    }
}
