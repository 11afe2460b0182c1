use serde::{Deserialize, Serialize};

/// Runtime settings, readable by every component. Mutated only through
/// `toggleAgentControl` or an operator config edit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Origin patterns a command URL must match (`domain` or `*.domain`).
    pub allowed_origins: Vec<String>,
    pub max_commands_per_minute: u32,
    pub max_concurrent_tabs: usize,
    /// Captured response bodies larger than this are skipped.
    pub max_response_body_bytes: usize,
    /// Host substring a captured response URL must contain.
    pub capture_host_filter: String,
    pub max_pages_per_search_term: u32,
    pub agent_control_enabled: bool,
    pub agent_endpoint: String,
    pub data_endpoint: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["etsy.com".to_string()],
            max_commands_per_minute: 10,
            max_concurrent_tabs: 3,
            max_response_body_bytes: 2_000_000,
            capture_host_filter: "etsy.com".to_string(),
            max_pages_per_search_term: 5,
            agent_control_enabled: true,
            agent_endpoint: "ws://localhost:8000/ws/extension".to_string(),
            data_endpoint: "ws://localhost:8000/ws/data".to_string(),
        }
    }
}

impl Settings {
    /// Clamp numeric fields to their documented floors.
    pub fn validated(mut self) -> Self {
        self.max_commands_per_minute = self.max_commands_per_minute.max(1);
        self.max_concurrent_tabs = self.max_concurrent_tabs.max(1);
        self.max_response_body_bytes = self.max_response_body_bytes.max(1);
        self.max_pages_per_search_term = self.max_pages_per_search_term.max(1);
        self
    }
}
