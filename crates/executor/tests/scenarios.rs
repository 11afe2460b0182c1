//! End-to-end scenarios for the execution engine, driven through mock
//! browser and content ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use tabpilot_cdp_driver::{DriverError, ProbeEvent, ResponseBody, TabDriver};
use tabpilot_core_types::{
    CommandOutcome, CommandStatus, ErrorCode, Settings, TabId,
};
use tabpilot_data_stream::RecordSink;
use tabpilot_executor::{CoreEvent, Executor};
use tabpilot_extract::{AdapterOutcome, ContentAdapter};
use tabpilot_state_center::StateCenter;
use tabpilot_tab_registry::SessionRegistry;

struct MockDriver {
    tabs_opened: AtomicUsize,
    fail_attach: AtomicBool,
    timeout_load: AtomicBool,
    closed: Mutex<Vec<TabId>>,
    bodies: Mutex<HashMap<String, String>>,
    probe_tx: broadcast::Sender<ProbeEvent>,
}

impl MockDriver {
    fn new() -> Arc<Self> {
        let (probe_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tabs_opened: AtomicUsize::new(0),
            fail_attach: AtomicBool::new(false),
            timeout_load: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
            bodies: Mutex::new(HashMap::new()),
            probe_tx,
        })
    }

    fn emit_body(&self, tab: &TabId, url: &str, raw: &str) {
        let request_id = format!("req-{}", self.bodies.lock().len());
        self.bodies.lock().insert(request_id.clone(), raw.to_string());
        let _ = self.probe_tx.send(ProbeEvent {
            tab: tab.clone(),
            request_id,
            url: url.to_string(),
            mime_type: "application/json".to_string(),
        });
    }

    fn opened(&self) -> usize {
        self.tabs_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TabDriver for MockDriver {
    async fn open_tab(&self, _url: &str, _background: bool) -> Result<TabId, DriverError> {
        let n = self.tabs_opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(TabId::new(format!("tab-{n}")))
    }

    async fn wait_for_load(&self, tab: &TabId, _timeout: Duration) -> Result<(), DriverError> {
        if self.timeout_load.load(Ordering::Relaxed) {
            Err(DriverError::Timeout(format!("load of tab {tab} timed out")))
        } else {
            Ok(())
        }
    }

    async fn attach(&self, _tab: &TabId) -> Result<(), DriverError> {
        if self.fail_attach.load(Ordering::Relaxed) {
            Err(DriverError::Attach("debugger busy".into()))
        } else {
            Ok(())
        }
    }

    async fn detach(&self, _tab: &TabId) -> Result<(), DriverError> {
        Ok(())
    }

    async fn fetch_response_body(
        &self,
        _tab: &TabId,
        request_id: &str,
    ) -> Result<ResponseBody, DriverError> {
        let body = self
            .bodies
            .lock()
            .get(request_id)
            .cloned()
            .ok_or_else(|| DriverError::protocol("unknown request"))?;
        Ok(ResponseBody {
            body,
            base64_encoded: false,
        })
    }

    async fn eval(&self, _tab: &TabId, _expression: &str) -> Result<Value, DriverError> {
        Ok(Value::Null)
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), DriverError> {
        self.closed.lock().push(tab.clone());
        Ok(())
    }

    fn probe_events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.probe_tx.subscribe()
    }
}

struct MockAdapter {
    active_page: Mutex<Option<u32>>,
}

impl MockAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active_page: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ContentAdapter for MockAdapter {
    async fn scroll_to_bottom(&self, _tab: &TabId, _params: &Map<String, Value>) -> AdapterOutcome {
        AdapterOutcome::ok(json!({ "iterations": 2 }))
    }

    async fn click(&self, _tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome {
        if params.get("selector").is_none() {
            AdapterOutcome::err("MISSING_SELECTOR")
        } else {
            AdapterOutcome::ok(json!({ "clicks": 1 }))
        }
    }

    async fn extract_schema(&self, _tab: &TabId, _params: &Map<String, Value>) -> AdapterOutcome {
        AdapterOutcome::ok(json!({
            "listings": [
                {"listing_id": "1", "title": "Brass lamp", "url": "https://www.etsy.com/listing/1"},
                {"listing_id": "", "title": "", "url": ""}
            ],
            "schemas": [{"@type": "Product"}],
            "total_results_count": 200
        }))
    }

    async fn get_active_page(&self, _tab: &TabId) -> Option<u32> {
        *self.active_page.lock()
    }
}

#[derive(Default)]
struct MockSink {
    records: Mutex<Vec<Value>>,
    exports: AtomicUsize,
}

impl RecordSink for MockSink {
    fn stream(&self, record: Value) {
        self.records.lock().push(record);
    }

    fn export(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
    }
}

struct Harness {
    executor: Arc<Executor>,
    state: Arc<StateCenter>,
    driver: Arc<MockDriver>,
    adapter: Arc<MockAdapter>,
    sink: Arc<MockSink>,
}

fn harness(settings: Settings) -> Harness {
    let state = Arc::new(StateCenter::new(settings));
    let driver = MockDriver::new();
    let adapter = MockAdapter::new();
    let sink = Arc::new(MockSink::default());
    let registry = SessionRegistry::new(driver.clone());
    registry.start();
    let executor = Executor::new(
        state.clone(),
        registry,
        driver.clone(),
        adapter.clone(),
        sink.clone(),
    );
    executor.start();
    Harness {
        executor,
        state,
        driver,
        adapter,
        sink,
    }
}

async fn wait_for_result(
    rx: &mut broadcast::Receiver<CoreEvent>,
    command_id: &str,
) -> CommandOutcome {
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            if let Ok(CoreEvent::CommandResult { command_id: id, result }) = rx.recv().await {
                if id == command_id {
                    return result;
                }
            }
        }
    })
    .await
    .expect("result in time")
}

#[tokio::test]
async fn s1_domain_rejection_never_queues() {
    let h = harness(Settings::default());
    let verdict = h.executor.enqueue(&json!({
        "id": "a",
        "type": "OPEN_URL",
        "payload": {"url": "https://example.com/"}
    }));
    assert_eq!(verdict.status, CommandStatus::Rejected);
    assert_eq!(verdict.error, Some(ErrorCode::DomainNotAllowed));
    assert_eq!(h.executor.queue_len(), 0);

    let logs = h.state.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, CommandStatus::Rejected);
    assert_eq!(logs[0].error_code.as_deref(), Some("DOMAIN_NOT_ALLOWED"));
    assert_eq!(logs[0].url.as_deref(), Some("https://example.com/"));
}

#[tokio::test]
async fn s2_rate_limit_admits_exactly_the_ceiling() {
    let settings = Settings {
        max_commands_per_minute: 3,
        ..Settings::default()
    };
    let h = harness(settings);
    let mut verdicts = Vec::new();
    for i in 0..4 {
        verdicts.push(h.executor.enqueue(&json!({
            "id": format!("w-{i}"),
            "type": "WAIT",
            "payload": {"milliseconds": 1}
        })));
    }
    assert!(verdicts[..3]
        .iter()
        .all(|v| v.status == CommandStatus::Queued));
    assert_eq!(verdicts[3].status, CommandStatus::Rejected);
    assert_eq!(verdicts[3].error, Some(ErrorCode::RateLimited));
}

#[tokio::test]
async fn admission_validates_shape_and_agent_control() {
    let h = harness(Settings::default());

    let missing_id = h.executor.enqueue(&json!({"type": "WAIT"}));
    assert_eq!(missing_id.error, Some(ErrorCode::InvalidCommand));

    let unknown_verb = h
        .executor
        .enqueue(&json!({"id": "x", "type": "TELEPORT"}));
    assert_eq!(unknown_verb.error, Some(ErrorCode::InvalidCommand));

    h.state.set_agent_control(false);
    let disabled = h.executor.enqueue(&json!({
        "id": "y",
        "type": "WAIT",
        "payload": {}
    }));
    assert_eq!(disabled.error, Some(ErrorCode::AgentDisabled));
}

#[tokio::test]
async fn commands_drain_in_fifo_order() {
    let h = harness(Settings::default());
    let mut rx = h.executor.subscribe();

    for id in ["first", "second"] {
        let verdict = h.executor.enqueue(&json!({
            "id": id,
            "type": "WAIT",
            "payload": {"milliseconds": 30}
        }));
        assert_eq!(verdict.status, CommandStatus::Queued);
    }

    let first = wait_for_result(&mut rx, "first").await;
    assert!(first.is_completed());
    // "second" must terminate after "first"; its result is still pending
    // when the first one lands because the drain is single-consumer.
    let second = wait_for_result(&mut rx, "second").await;
    assert!(second.is_completed());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.executor.queue_len(), 0);
    assert!(!h.state.processing());
}

#[tokio::test]
async fn s3_nested_actions_log_each_step_and_stream_records() {
    let h = harness(Settings::default());
    let mut rx = h.executor.subscribe();

    let verdict = h.executor.enqueue(&json!({
        "id": "b",
        "type": "OPEN_URL",
        "payload": {
            "url": "https://etsy.com/search?q=lamp",
            "actions": [
                {"type": "WAIT", "payload": {"milliseconds": 50}},
                {"type": "SCROLL_TO_BOTTOM", "payload": {}},
                {"type": "EXTRACT_SCHEMA", "payload": {}}
            ]
        }
    }));
    assert_eq!(verdict.status, CommandStatus::Queued);

    let parent = wait_for_result(&mut rx, "b").await;
    assert!(parent.is_completed());
    assert_eq!(parent.data.get("tabId"), Some(&json!("tab-1")));

    let logs = h.state.logs();
    let ids: Vec<&str> = logs.iter().map(|entry| entry.id.as_str()).collect();
    assert!(ids.contains(&"b:0:WAIT"));
    assert!(ids.contains(&"b:1:SCROLL_TO_BOTTOM"));
    assert!(ids.contains(&"b:2:EXTRACT_SCHEMA"));
    let parent_entry = logs.iter().find(|entry| entry.id == "b").expect("parent log");
    assert_eq!(parent_entry.status, CommandStatus::Completed);

    let records = h.sink.records.lock();
    let metadata: Vec<&Value> = records
        .iter()
        .filter(|r| r["recordType"] == "SEARCH_METADATA")
        .collect();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0]["total_results_count"], 200);
    let listings: Vec<&Value> = records
        .iter()
        .filter(|r| r["recordType"] == "LISTING")
        .collect();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0]["commandId"], "b:2:EXTRACT_SCHEMA");
    assert_eq!(listings[0]["source"], "etsy");

    let summary = h.state.result("b:2:EXTRACT_SCHEMA").expect("extract summary");
    assert_eq!(summary.extra.get("itemsStreamed"), Some(&json!(1)));
    assert_eq!(summary.extra.get("rejectedCount"), Some(&json!(1)));
    assert_eq!(summary.extra.get("totalListingsFound"), Some(&json!(2)));
}

#[tokio::test]
async fn s4_capture_is_additive_across_navigation_and_wait() {
    let h = harness(Settings::default());
    let mut rx = h.executor.subscribe();

    // Two JSON responses land while the WAIT sub-action sleeps.
    {
        let driver = h.driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let tab = TabId::new("tab-1");
            driver.emit_body(&tab, "https://www.etsy.com/api/v3/search", "{\"ok\":1}");
            driver.emit_body(&tab, "https://www.etsy.com/api/v3/search2", "{\"ok\":2}");
        });
    }

    let verdict = h.executor.enqueue(&json!({
        "id": "d",
        "type": "OPEN_URL",
        "payload": {
            "url": "https://etsy.com/search?q=lamp",
            "actions": [
                {"type": "WAIT", "payload": {"milliseconds": 400}},
                {"type": "CAPTURE_JSON_FROM_DEVTOOLS", "payload": {"captureType": "listings", "waitForMs": 50}}
            ]
        }
    }));
    assert_eq!(verdict.status, CommandStatus::Queued);

    let parent = wait_for_result(&mut rx, "d").await;
    assert!(parent.is_completed());
    let records = parent
        .data
        .get("records")
        .and_then(Value::as_array)
        .expect("captured records");
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record["source"], "raw");
        assert_eq!(record["captureType"], "listings");
        assert!(record["json"].is_object());
    }
    // The capture handler closed the tab by default.
    assert!(h.driver.closed.lock().contains(&TabId::new("tab-1")));
}

#[tokio::test]
async fn oversize_bodies_are_skipped_and_parse_failures_are_not_fatal() {
    let settings = Settings {
        max_response_body_bytes: 16,
        ..Settings::default()
    };
    let h = harness(settings);
    let mut rx = h.executor.subscribe();

    {
        let driver = h.driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let tab = TabId::new("tab-1");
            driver.emit_body(&tab, "https://www.etsy.com/a", "{\"ok\":1}");
            driver.emit_body(&tab, "https://www.etsy.com/b", "not json at all");
            driver.emit_body(
                &tab,
                "https://www.etsy.com/c",
                "{\"way\":\"too big for the sixteen byte budget\"}",
            );
        });
    }

    h.executor.enqueue(&json!({
        "id": "e",
        "type": "OPEN_URL",
        "payload": {
            "url": "https://etsy.com/x",
            "actions": [
                {"type": "WAIT", "payload": {"milliseconds": 400}},
                {"type": "CAPTURE_JSON_FROM_DEVTOOLS", "payload": {"waitForMs": 50}}
            ]
        }
    }));

    let parent = wait_for_result(&mut rx, "e").await;
    assert!(parent.is_completed());
    let records = parent.data.get("records").and_then(Value::as_array).unwrap();
    assert_eq!(records.len(), 1, "only the small, valid body becomes a record");
}

#[tokio::test]
async fn attach_failure_closes_the_tab() {
    let h = harness(Settings::default());
    h.driver.fail_attach.store(true, Ordering::Relaxed);
    let mut rx = h.executor.subscribe();

    h.executor.enqueue(&json!({
        "id": "f",
        "type": "OPEN_URL",
        "payload": {"url": "https://etsy.com/x"}
    }));

    let parent = wait_for_result(&mut rx, "f").await;
    assert_eq!(parent.status, CommandStatus::Failed);
    assert_eq!(parent.error_code.as_deref(), Some("ATTACH_FAILED"));
    assert!(h.driver.closed.lock().contains(&TabId::new("tab-1")));
}

#[tokio::test]
async fn navigation_timeout_maps_to_its_error_code() {
    let h = harness(Settings::default());
    h.driver.timeout_load.store(true, Ordering::Relaxed);
    let mut rx = h.executor.subscribe();

    h.executor.enqueue(&json!({
        "id": "g",
        "type": "OPEN_URL",
        "payload": {"url": "https://etsy.com/x"}
    }));

    let parent = wait_for_result(&mut rx, "g").await;
    assert_eq!(parent.error_code.as_deref(), Some("NAVIGATION_TIMEOUT"));
}

#[tokio::test]
async fn s5_search_task_stops_on_page_fallback_and_exports_once() {
    let h = harness(Settings::default());
    *h.adapter.active_page.lock() = Some(1);
    let mut rx = h.executor.subscribe();

    h.executor.enqueue(&json!({
        "id": "s",
        "type": "EXECUTE_SEARCH_TASK",
        "payload": {
            "searchTerms": ["x"],
            "actions": [{"type": "SCROLL_TO_BOTTOM", "payload": {}}]
        }
    }));

    let parent = wait_for_result(&mut rx, "s").await;
    assert!(parent.is_completed());

    // Page 1 reports active page 1 (fine), page 2 reports 1 < 2 → stop.
    assert_eq!(h.driver.opened(), 2);
    assert_eq!(h.sink.exports.load(Ordering::Relaxed), 1);
    // Every page tab was cleaned up even though the term stopped early.
    assert_eq!(h.driver.closed.lock().len(), 2);
}

#[tokio::test]
async fn sub_action_failure_semantics_keep_partial_success() {
    let h = harness(Settings::default());
    let mut rx = h.executor.subscribe();

    // CLICK without a selector fails, WAIT succeeds → parent completed.
    h.executor.enqueue(&json!({
        "id": "p",
        "type": "OPEN_URL",
        "payload": {
            "url": "https://etsy.com/x",
            "actions": [
                {"type": "CLICK", "payload": {}},
                {"type": "WAIT", "payload": {"milliseconds": 10}}
            ]
        }
    }));
    let partial = wait_for_result(&mut rx, "p").await;
    assert!(partial.is_completed());

    let click_summary = h.state.result("p:0:CLICK").expect("click summary");
    assert_eq!(click_summary.status, CommandStatus::Failed);
    assert_eq!(click_summary.error_code.as_deref(), Some("MISSING_SELECTOR"));

    // All sub-actions failing fails the parent with the first code.
    let mut rx = h.executor.subscribe();
    h.executor.enqueue(&json!({
        "id": "q",
        "type": "OPEN_URL",
        "payload": {
            "url": "https://etsy.com/x",
            "actions": [{"type": "CLICK", "payload": {}}]
        }
    }));
    let failed = wait_for_result(&mut rx, "q").await;
    assert_eq!(failed.status, CommandStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("MISSING_SELECTOR"));
}
