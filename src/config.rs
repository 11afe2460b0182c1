//! Application configuration: a YAML file overlaid on built-in defaults,
//! plus the persisted settings from the state file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use tabpilot_core_types::Settings;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub settings: Settings,
    pub browser: BrowserConfig,
    /// Where settings, logs and result summaries persist across restarts.
    pub state_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserConfig {
    /// DevTools endpoint of the browser this instance drives.
    pub websocket_url: String,
    pub command_deadline_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            websocket_url: "ws://127.0.0.1:9222/devtools/browser".to_string(),
            command_deadline_ms: 10_000,
        }
    }
}

impl AppConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tabpilot")
                .join("state.json")
        })
    }
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let Some(mut base) = dirs::config_dir() else {
                return Ok(AppConfig::default());
            };
            base.push("tabpilot");
            base.push("config.yaml");
            base
        }
    };

    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: AppConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}
