//! Single owner of the mutable core state: settings, the bounded execution
//! log, per-command result summaries, queue gauges and bridge status. All
//! other components ask this owner to read or mutate.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use tabpilot_core_types::{BridgeStatus, ExtensionState, LogEntry, ResultSummary, Settings};

/// Log ring capacity; oldest entries drop first.
pub const LOG_CAPACITY: usize = 200;
/// How many recent log entries travel in a state snapshot.
pub const SNAPSHOT_LOG_LIMIT: usize = 20;

#[derive(Debug)]
struct BoundedRing<T> {
    capacity: usize,
    data: VecDeque<T>,
}

impl<T: Clone> BoundedRing<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            data: VecDeque::new(),
        }
    }

    fn push(&mut self, item: T) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(item);
    }

    fn snapshot(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }

    fn tail(&self, limit: usize) -> Vec<T> {
        let skip = self.data.len().saturating_sub(limit);
        self.data.iter().skip(skip).cloned().collect()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// On-disk layout of the state file. `commands` is reserved for replay and
/// kept empty by the core.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    settings: Settings,
    logs: Vec<LogEntry>,
    results: serde_json::Map<String, Value>,
    #[serde(default)]
    commands: Vec<Value>,
}

pub struct StateCenter {
    settings: RwLock<Settings>,
    logs: Mutex<BoundedRing<LogEntry>>,
    results: DashMap<String, ResultSummary>,
    queue_length: AtomicUsize,
    processing: AtomicBool,
    bridge_status: Mutex<BridgeStatus>,
    state_path: Option<PathBuf>,
}

impl StateCenter {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings.validated()),
            logs: Mutex::new(BoundedRing::new(LOG_CAPACITY)),
            results: DashMap::new(),
            queue_length: AtomicUsize::new(0),
            processing: AtomicBool::new(false),
            bridge_status: Mutex::new(BridgeStatus::Disconnected),
            state_path: None,
        }
    }

    /// Bind a state file: persisted settings/logs/results override the
    /// provided defaults when the file exists and parses.
    pub fn with_state_file(settings: Settings, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let center = match Self::load(&path) {
            Some(persisted) => {
                debug!(target: "state-center", path = %path.display(), "restored persisted state");
                let center = Self::new(persisted.settings);
                {
                    let mut logs = center.logs.lock();
                    for entry in persisted.logs {
                        logs.push(entry);
                    }
                }
                for (id, value) in persisted.results {
                    if let Ok(summary) = serde_json::from_value::<ResultSummary>(value) {
                        center.results.insert(id, summary);
                    }
                }
                center
            }
            None => Self::new(settings),
        };
        Self {
            state_path: Some(path),
            ..center
        }
    }

    fn load(path: &Path) -> Option<PersistedState> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(target: "state-center", path = %path.display(), %err, "state file unreadable, starting fresh");
                None
            }
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn agent_control_enabled(&self) -> bool {
        self.settings.read().agent_control_enabled
    }

    pub fn set_agent_control(&self, enabled: bool) -> Settings {
        let mut guard = self.settings.write();
        guard.agent_control_enabled = enabled;
        guard.clone()
    }

    pub fn replace_settings(&self, settings: Settings) {
        *self.settings.write() = settings.validated();
    }

    pub fn append_log(&self, entry: LogEntry) {
        self.logs.lock().push(entry);
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().snapshot()
    }

    pub fn log_len(&self) -> usize {
        self.logs.lock().len()
    }

    pub fn record_result(&self, command_id: impl Into<String>, summary: ResultSummary) {
        self.results.insert(command_id.into(), summary);
    }

    pub fn result(&self, command_id: &str) -> Option<ResultSummary> {
        self.results.get(command_id).map(|entry| entry.value().clone())
    }

    pub fn set_queue_length(&self, depth: usize) {
        self.queue_length.store(depth, Ordering::Relaxed);
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length.load(Ordering::Relaxed)
    }

    pub fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::Relaxed);
    }

    pub fn processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    pub fn set_bridge_status(&self, status: BridgeStatus) {
        *self.bridge_status.lock() = status;
    }

    pub fn bridge_status(&self) -> BridgeStatus {
        *self.bridge_status.lock()
    }

    pub fn snapshot(&self) -> ExtensionState {
        ExtensionState {
            settings: self.settings(),
            queue_length: self.queue_length(),
            processing: self.processing(),
            logs: self.logs.lock().tail(SNAPSHOT_LOG_LIMIT),
            bridge_status: self.bridge_status(),
        }
    }

    /// Write the state file. Best-effort at call sites: failures are logged
    /// by the caller, never fatal.
    pub fn persist(&self) -> io::Result<()> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(());
        };
        let mut results = serde_json::Map::new();
        for entry in self.results.iter() {
            if let Ok(value) = serde_json::to_value(entry.value()) {
                results.insert(entry.key().clone(), value);
            }
        }
        let state = PersistedState {
            settings: self.settings(),
            logs: self.logs(),
            results,
            commands: Vec::new(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &state)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        writer.flush()
    }
}
