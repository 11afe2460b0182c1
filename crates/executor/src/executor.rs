use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use tabpilot_action_gate::{allowed, RateLimiter};
use tabpilot_cdp_driver::{DriverError, TabDriver};
use tabpilot_core_types::command::{bool_field, str_field, u64_field};
use tabpilot_core_types::{
    AdmissionVerdict, CaptureMode, CapturedRecord, Command, CommandAction, CommandOutcome,
    CommandStatus, CommandType, ErrorCode, LogEntry, ResultSummary, TabId,
};
use tabpilot_data_stream::RecordSink;
use tabpilot_extract::{
    transform_captured, transformer_labels, validate_listing, ContentAdapter, RECORD_SOURCE,
};
use tabpilot_state_center::StateCenter;
use tabpilot_tab_registry::SessionRegistry;

use crate::events::CoreEvent;
use crate::search;

/// Tab load budget before a command fails with `NAVIGATION_TIMEOUT`.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_MS: u64 = 1000;
const DEFAULT_CAPTURE_WAIT_MS: u64 = 5000;

/// The command execution engine. Strictly one command executes at a time;
/// sub-actions run inside their parent's slot and never re-enter the queue.
pub struct Executor {
    pub(crate) state: Arc<StateCenter>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) driver: Arc<dyn TabDriver>,
    pub(crate) adapter: Arc<dyn ContentAdapter>,
    pub(crate) sink: Arc<dyn RecordSink>,
    rate: RateLimiter,
    queue: Mutex<VecDeque<Command>>,
    wakeup: Notify,
    events: broadcast::Sender<CoreEvent>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        state: Arc<StateCenter>,
        registry: Arc<SessionRegistry>,
        driver: Arc<dyn TabDriver>,
        adapter: Arc<dyn ContentAdapter>,
        sink: Arc<dyn RecordSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state,
            registry,
            driver,
            adapter,
            sink,
            rate: RateLimiter::new(),
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            events,
            drain: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Start the drain worker. Idempotent: a second call while one is
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.drain.lock();
        if guard.is_some() {
            return;
        }
        let executor = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                let next = executor.queue.lock().pop_front();
                match next {
                    Some(command) => {
                        executor.state.set_queue_length(executor.queue_len());
                        executor.run_command(command).await;
                    }
                    None => executor.wakeup.notified().await,
                }
            }
        }));
    }

    /// Admission control and queueing. Rejections are logged and never
    /// enqueued; admissions return `{status: queued}` immediately.
    pub fn enqueue(&self, raw: &Value) -> AdmissionVerdict {
        let command = match Command::parse(raw) {
            Ok(command) => command,
            Err(err) => {
                return self.reject(raw_id(raw), raw_kind(raw), raw_url(raw), err.code);
            }
        };

        let settings = self.state.settings();
        if !settings.agent_control_enabled {
            return self.reject(
                command.id.clone(),
                command.kind.as_str().to_string(),
                command.url().map(str::to_string),
                ErrorCode::AgentDisabled,
            );
        }
        if !self.rate.admit(settings.max_commands_per_minute) {
            return self.reject(
                command.id.clone(),
                command.kind.as_str().to_string(),
                command.url().map(str::to_string),
                ErrorCode::RateLimited,
            );
        }
        if let Some(url) = command.url() {
            if !allowed(url, &settings.allowed_origins) {
                return self.reject(
                    command.id.clone(),
                    command.kind.as_str().to_string(),
                    Some(url.to_string()),
                    ErrorCode::DomainNotAllowed,
                );
            }
        }

        info!(target: "executor", id = %command.id, kind = %command.kind, "command admitted");
        {
            let mut queue = self.queue.lock();
            queue.push_back(command);
            self.state.set_queue_length(queue.len());
        }
        self.wakeup.notify_one();
        self.emit(CoreEvent::StateChanged);
        AdmissionVerdict::queued()
    }

    fn reject(
        &self,
        id: String,
        kind: String,
        url: Option<String>,
        code: ErrorCode,
    ) -> AdmissionVerdict {
        warn!(target: "executor", %id, %kind, %code, "command rejected");
        let mut entry = LogEntry::new(&id, &kind, CommandStatus::Rejected).with_error(code.as_str());
        if let Some(url) = url {
            entry = entry.with_url(url);
        }
        self.state.append_log(entry);
        self.state.record_result(
            &id,
            ResultSummary {
                status: CommandStatus::Rejected,
                error_code: Some(code.as_str().to_string()),
                command_type: kind,
                extra: Map::new(),
            },
        );
        self.persist_best_effort();
        self.emit(CoreEvent::StateChanged);
        AdmissionVerdict::rejected(code)
    }

    async fn run_command(&self, command: Command) {
        let Command {
            id,
            kind,
            mut payload,
            actions,
        } = command;
        // Top-level `actions` folds into the payload so handlers see one form.
        if !payload.contains_key("actions") {
            if let Some(actions) = actions {
                if let Ok(value) = serde_json::to_value(actions) {
                    payload.insert("actions".to_string(), value);
                }
            }
        }
        let url = str_field(&payload, "url").map(str::to_string);

        self.state.set_processing(true);
        self.emit(CoreEvent::StateChanged);

        let outcome = self.dispatch(&id, kind, payload, None).await;
        self.record_step(&id, kind.as_str(), &outcome, url.as_deref());

        self.state.set_processing(false);
        self.emit(CoreEvent::StateChanged);
    }

    /// Persist, log and announce one terminal step (top-level command,
    /// sub-action or internal search page).
    pub(crate) fn record_step(
        &self,
        id: &str,
        kind: &str,
        outcome: &CommandOutcome,
        url: Option<&str>,
    ) {
        let mut entry = LogEntry::new(id, kind, outcome.status);
        if let Some(code) = outcome.error_code.as_deref() {
            entry = entry.with_error(code);
        }
        if let Some(url) = url {
            entry = entry.with_url(url);
        }
        self.state.append_log(entry);
        self.state
            .record_result(id, ResultSummary::from_outcome(kind, outcome));
        self.persist_best_effort();
        self.emit(CoreEvent::CommandResult {
            command_id: id.to_string(),
            result: outcome.clone(),
        });
    }

    fn persist_best_effort(&self) {
        if let Err(err) = self.state.persist() {
            warn!(target: "executor", %err, "state persist failed");
        }
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    /// Execute one step and record its terminal state. Used for sub-actions
    /// and the search driver's internal commands; bypasses the queue.
    pub(crate) async fn run_step(
        &self,
        id: &str,
        kind: CommandType,
        payload: Map<String, Value>,
        tab: Option<TabId>,
    ) -> CommandOutcome {
        let url = str_field(&payload, "url").map(str::to_string);
        let outcome = self.dispatch(id, kind, payload, tab).await;
        self.record_step(id, kind.as_str(), &outcome, url.as_deref());
        outcome
    }

    pub(crate) fn dispatch<'a>(
        &'a self,
        id: &'a str,
        kind: CommandType,
        payload: Map<String, Value>,
        tab: Option<TabId>,
    ) -> BoxFuture<'a, CommandOutcome> {
        async move {
            match kind {
                CommandType::OpenUrl => self.handle_open_url(id, payload).await,
                CommandType::Wait => {
                    let millis = u64_field(&payload, "milliseconds").unwrap_or(DEFAULT_WAIT_MS);
                    sleep(Duration::from_millis(millis)).await;
                    CommandOutcome::completed()
                }
                CommandType::ScrollToBottom => match resolve_tab(&payload, tab) {
                    Some(tab) => {
                        let outcome = self.adapter.scroll_to_bottom(&tab, &payload).await;
                        adapter_result(outcome, "data")
                    }
                    None => CommandOutcome::failed(ErrorCode::InvalidCommand),
                },
                CommandType::Click => match resolve_tab(&payload, tab) {
                    Some(tab) => {
                        let outcome = self.adapter.click(&tab, &payload).await;
                        adapter_result(outcome, "data")
                    }
                    None => CommandOutcome::failed(ErrorCode::InvalidCommand),
                },
                CommandType::CaptureJsonFromDevtools => {
                    self.handle_capture(id, payload, tab).await
                }
                CommandType::ExtractSchema => self.handle_extract(id, payload, tab).await,
                CommandType::ExecuteSearchTask => search::run(self, id, &payload).await,
            }
        }
        .boxed()
    }

    async fn handle_open_url(&self, id: &str, payload: Map<String, Value>) -> CommandOutcome {
        let Some(url) = str_field(&payload, "url").map(str::to_string) else {
            return CommandOutcome::failed(ErrorCode::InvalidCommand);
        };
        let actions: Vec<CommandAction> = match payload.get("actions") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(actions) => actions,
                Err(_) => return CommandOutcome::failed(ErrorCode::InvalidCommand),
            },
        };

        let settings = self.state.settings();
        self.registry.reserve_slot(settings.max_concurrent_tabs).await;

        let tab = match self.driver.open_tab(&url, true).await {
            Ok(tab) => tab,
            Err(err) => {
                warn!(target: "executor", %id, %err, "tab open failed");
                return CommandOutcome::failed_message(err.to_string());
            }
        };

        if let Err(err) = self.driver.wait_for_load(&tab, NAVIGATION_TIMEOUT).await {
            let _ = self.driver.close_tab(&tab).await;
            return match err {
                DriverError::Timeout(_) => CommandOutcome::failed(ErrorCode::NavigationTimeout),
                other => CommandOutcome::failed_message(other.to_string()),
            };
        }

        if let Err(err) = self.driver.attach(&tab).await {
            warn!(target: "executor", %id, %err, "probe attach failed");
            let _ = self.driver.close_tab(&tab).await;
            return CommandOutcome::failed(ErrorCode::AttachFailed);
        }
        self.registry
            .open_session(tab.clone(), id, transformer_labels(), settings);

        let mut records: Vec<Value> = Vec::new();
        let mut any_completed = false;
        let mut first_failure: Option<String> = None;

        for (index, action) in actions.iter().enumerate() {
            let sub_id = format!("{id}:{index}:{}", action.kind);
            let mut sub_payload = action.payload.clone();
            sub_payload.insert("tabId".to_string(), json!(tab.0));
            let outcome = self
                .run_step(&sub_id, action.kind, sub_payload, Some(tab.clone()))
                .await;
            if outcome.is_completed() {
                any_completed = true;
            } else if first_failure.is_none() {
                first_failure = outcome.error_code.clone();
            }
            if let Some(Value::Array(items)) = outcome.data.get("records") {
                records.extend(items.iter().cloned());
            }
        }

        let succeeded = actions.is_empty() || any_completed || !records.is_empty();
        let mut outcome = if succeeded {
            CommandOutcome::completed()
        } else {
            CommandOutcome::failed_message(
                first_failure.unwrap_or_else(|| ErrorCode::UnknownError.as_str().to_string()),
            )
        };
        outcome = outcome.with("tabId", json!(tab.0));
        if !records.is_empty() {
            outcome = outcome.with("records", Value::Array(records));
        }
        outcome
    }

    /// Capture handler: switch the session's mode without touching the
    /// buffer, wait, then turn every buffered body into one record.
    async fn handle_capture(
        &self,
        id: &str,
        payload: Map<String, Value>,
        tab: Option<TabId>,
    ) -> CommandOutcome {
        let Some(tab) = resolve_tab(&payload, tab) else {
            return CommandOutcome::failed(ErrorCode::InvalidCommand);
        };
        let mode = match str_field(&payload, "captureType") {
            None => CaptureMode::Listings,
            Some(label) => match CaptureMode::parse(label) {
                Some(mode) => mode,
                None => return CommandOutcome::failed(ErrorCode::InvalidCommand),
            },
        };
        self.registry.set_capture_mode(&tab, mode);

        let wait = u64_field(&payload, "waitForMs").unwrap_or(DEFAULT_CAPTURE_WAIT_MS);
        sleep(Duration::from_millis(wait)).await;

        let Some(session) = self.registry.get(&tab) else {
            return CommandOutcome::failed_message(format!("no capture session for tab {tab}"));
        };
        let (bodies, max_bytes) = {
            let guard = session.lock();
            (guard.captured.clone(), guard.settings.max_response_body_bytes)
        };

        let mut records: Vec<Value> = Vec::new();
        let mut parse_failures = 0usize;
        for body in bodies {
            if body.raw.len() > max_bytes {
                continue;
            }
            match serde_json::from_str::<Value>(&body.raw) {
                Ok(parsed) => {
                    let record = CapturedRecord {
                        source: "raw".to_string(),
                        url: body.url,
                        capture_type: mode,
                        json: transform_captured(mode, parsed),
                    };
                    if let Ok(value) = serde_json::to_value(record) {
                        records.push(value);
                    }
                }
                Err(err) => {
                    parse_failures += 1;
                    debug!(target: "executor", %id, url = %body.url, %err, "capture body parse failed");
                }
            }
        }
        if parse_failures > 0 {
            warn!(target: "executor", %id, parse_failures, "capture finished with parse failures");
        }

        let close_tab = bool_field(&payload, "closeTab").unwrap_or(true);
        self.registry.cleanup(&tab, close_tab).await;

        CommandOutcome::completed().with("records", Value::Array(records))
    }

    async fn handle_extract(
        &self,
        id: &str,
        payload: Map<String, Value>,
        tab: Option<TabId>,
    ) -> CommandOutcome {
        let Some(tab) = resolve_tab(&payload, tab) else {
            return CommandOutcome::failed(ErrorCode::InvalidCommand);
        };
        let outcome = self.adapter.extract_schema(&tab, &payload).await;
        if !outcome.ok {
            return CommandOutcome::failed_message(
                outcome
                    .error
                    .unwrap_or_else(|| ErrorCode::ContentScriptError.as_str().to_string()),
            );
        }
        let data = outcome.data.unwrap_or_else(|| json!({}));
        let listings = data
            .get("listings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let schemas = data
            .get("schemas")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(total) = data.get("total_results_count").filter(|v| v.is_number()) {
            self.sink.stream(json!({
                "recordType": "SEARCH_METADATA",
                "commandId": id,
                "total_results_count": total,
            }));
        }

        let total_found = listings.len();
        let mut streamed = 0usize;
        let mut rejected = 0usize;
        for listing in listings {
            if !validate_listing(&listing) {
                rejected += 1;
                continue;
            }
            let mut record = listing.as_object().cloned().unwrap_or_default();
            record.insert("recordType".to_string(), json!("LISTING"));
            record.insert("commandId".to_string(), json!(id));
            record.insert("source".to_string(), json!(RECORD_SOURCE));
            if let Some(page) = payload.get("pageNumber") {
                record.insert("page_number".to_string(), page.clone());
            }
            if let Some(term) = payload.get("searchTerm") {
                record.insert("search_query".to_string(), term.clone());
            }
            self.sink.stream(Value::Object(record));
            streamed += 1;
        }

        CommandOutcome::completed()
            .with("itemsStreamed", json!(streamed))
            .with("totalListingsFound", json!(total_found))
            .with("rejectedCount", json!(rejected))
            .with("schemaCount", json!(schemas.len()))
            .with("schemas", Value::Array(schemas))
    }
}

fn resolve_tab(payload: &Map<String, Value>, ctx: Option<TabId>) -> Option<TabId> {
    ctx.or_else(|| str_field(payload, "tabId").map(TabId::new))
}

fn adapter_result(outcome: tabpilot_extract::AdapterOutcome, key: &str) -> CommandOutcome {
    if outcome.ok {
        CommandOutcome::completed().with(key, outcome.data.unwrap_or(Value::Null))
    } else {
        CommandOutcome::failed_message(
            outcome
                .error
                .unwrap_or_else(|| ErrorCode::ContentScriptError.as_str().to_string()),
        )
    }
}

fn raw_id(raw: &Value) -> String {
    raw.get("id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn raw_kind(raw: &Value) -> String {
    raw.get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string()
}

fn raw_url(raw: &Value) -> Option<String> {
    raw.pointer("/payload/url")
        .and_then(Value::as_str)
        .map(str::to_string)
}
