use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use tabpilot_core_types::TabId;

use crate::error::DriverError;
use crate::transport::{CdpTransport, TransportEvent};

/// A network response observed on a probed tab.
#[derive(Clone, Debug)]
pub struct ProbeEvent {
    pub tab: TabId,
    pub request_id: String,
    pub url: String,
    pub mime_type: String,
}

/// Raw response body as DevTools hands it over.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub body: String,
    #[serde(default)]
    pub base64_encoded: bool,
}

impl ResponseBody {
    /// Decoded body text, handling the base64 transport form.
    pub fn text(&self) -> Result<String, DriverError> {
        if !self.base64_encoded {
            return Ok(self.body.clone());
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.body)
            .map_err(DriverError::protocol)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Tab-level operations the executor and session registry build on.
#[async_trait]
pub trait TabDriver: Send + Sync {
    /// Create a tab already navigating to `url`; `background` keeps it
    /// inactive.
    async fn open_tab(&self, url: &str, background: bool) -> Result<TabId, DriverError>;
    async fn wait_for_load(&self, tab: &TabId, timeout: Duration) -> Result<(), DriverError>;
    /// Attach the network probe. Response events flow only while attached.
    async fn attach(&self, tab: &TabId) -> Result<(), DriverError>;
    async fn detach(&self, tab: &TabId) -> Result<(), DriverError>;
    async fn fetch_response_body(
        &self,
        tab: &TabId,
        request_id: &str,
    ) -> Result<ResponseBody, DriverError>;
    async fn eval(&self, tab: &TabId, expression: &str) -> Result<Value, DriverError>;
    async fn close_tab(&self, tab: &TabId) -> Result<(), DriverError>;
    fn probe_events(&self) -> broadcast::Receiver<ProbeEvent>;
}

#[derive(Debug)]
struct TabState {
    session_id: String,
    loaded: AtomicBool,
    load_notify: Notify,
    probing: AtomicBool,
}

/// DevTools-backed driver. One target session per tab; the pump task routes
/// wire events back to tabs by session id.
pub struct CdpDriver {
    transport: Arc<dyn CdpTransport>,
    tabs: DashMap<TabId, Arc<TabState>>,
    sessions: DashMap<String, TabId>,
    probe_tx: broadcast::Sender<ProbeEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: String,
    response: ResponseInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseInfo {
    url: String,
    #[serde(default)]
    mime_type: String,
}

impl CdpDriver {
    pub fn new(transport: Arc<dyn CdpTransport>) -> Arc<Self> {
        let (probe_tx, _) = broadcast::channel(512);
        Arc::new(Self {
            transport,
            tabs: DashMap::new(),
            sessions: DashMap::new(),
            probe_tx,
            pump: Mutex::new(None),
        })
    }

    /// Start the event pump. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.pump.lock();
        if guard.is_some() {
            return;
        }
        let driver = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                match driver.transport.next_event().await {
                    Some(event) => driver.handle_event(event),
                    None => sleep(Duration::from_millis(200)).await,
                }
            }
        }));
    }

    fn handle_event(&self, event: TransportEvent) {
        let Some(session_id) = event.session_id.as_deref() else {
            return;
        };
        let Some(tab) = self.sessions.get(session_id).map(|entry| entry.value().clone()) else {
            return;
        };
        match event.method.as_str() {
            "Network.responseReceived" => {
                let Some(state) = self.tabs.get(&tab).map(|entry| Arc::clone(entry.value())) else {
                    return;
                };
                if !state.probing.load(Ordering::Relaxed) {
                    return;
                }
                match serde_json::from_value::<ResponseReceivedParams>(event.params) {
                    Ok(params) => {
                        let _ = self.probe_tx.send(ProbeEvent {
                            tab,
                            request_id: params.request_id,
                            url: params.response.url,
                            mime_type: params.response.mime_type,
                        });
                    }
                    Err(err) => {
                        warn!(target: "cdp-driver", %err, "undecodable responseReceived params");
                    }
                }
            }
            "Page.loadEventFired" => {
                if let Some(state) = self.tabs.get(&tab) {
                    state.loaded.store(true, Ordering::Relaxed);
                    state.load_notify.notify_waiters();
                }
            }
            _ => {}
        }
    }

    fn tab_state(&self, tab: &TabId) -> Result<Arc<TabState>, DriverError> {
        self.tabs
            .get(tab)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DriverError::UnknownTab(tab.to_string()))
    }

    async fn session_command(
        &self,
        tab: &TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let state = self.tab_state(tab)?;
        self.transport
            .send_command(Some(&state.session_id), method, params)
            .await
    }
}

#[async_trait]
impl TabDriver for CdpDriver {
    async fn open_tab(&self, url: &str, background: bool) -> Result<TabId, DriverError> {
        let created = self
            .transport
            .send_command(
                None,
                "Target.createTarget",
                json!({ "url": url, "background": background }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::protocol("createTarget returned no targetId"))?
            .to_string();
        let tab = TabId::new(target_id.clone());

        let attached = self
            .transport
            .send_command(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await;
        let session_id = match attached {
            Ok(value) => match value.get("sessionId").and_then(Value::as_str) {
                Some(session) => session.to_string(),
                None => {
                    self.drop_target(&tab).await;
                    return Err(DriverError::protocol("attachToTarget returned no sessionId"));
                }
            },
            Err(err) => {
                self.drop_target(&tab).await;
                return Err(err);
            }
        };

        let state = Arc::new(TabState {
            session_id: session_id.clone(),
            loaded: AtomicBool::new(false),
            load_notify: Notify::new(),
            probing: AtomicBool::new(false),
        });
        self.tabs.insert(tab.clone(), state);
        self.sessions.insert(session_id, tab.clone());

        // Page domain feeds the load tracker.
        if let Err(err) = self.session_command(&tab, "Page.enable", json!({})).await {
            self.close_tab(&tab).await.ok();
            return Err(err);
        }

        debug!(target: "cdp-driver", %tab, url, "tab opened");
        Ok(tab)
    }

    async fn wait_for_load(&self, tab: &TabId, timeout: Duration) -> Result<(), DriverError> {
        let state = self.tab_state(tab)?;
        let notified = state.load_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        // The load event may have fired before Page.enable finished.
        if let Ok(ready) = self.eval(tab, "document.readyState").await {
            if ready.as_str() == Some("complete") {
                state.loaded.store(true, Ordering::Relaxed);
                return Ok(());
            }
        }
        tokio::time::timeout(timeout, notified)
            .await
            .map_err(|_| DriverError::Timeout(format!("load of tab {tab} timed out")))
    }

    async fn attach(&self, tab: &TabId) -> Result<(), DriverError> {
        let state = self.tab_state(tab)?;
        self.session_command(tab, "Network.enable", json!({}))
            .await
            .map_err(|err| DriverError::Attach(err.to_string()))?;
        state.probing.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn detach(&self, tab: &TabId) -> Result<(), DriverError> {
        let state = self.tab_state(tab)?;
        state.probing.store(false, Ordering::Relaxed);
        self.session_command(tab, "Network.disable", json!({})).await?;
        Ok(())
    }

    async fn fetch_response_body(
        &self,
        tab: &TabId,
        request_id: &str,
    ) -> Result<ResponseBody, DriverError> {
        let value = self
            .session_command(tab, "Network.getResponseBody", json!({ "requestId": request_id }))
            .await?;
        serde_json::from_value(value).map_err(DriverError::protocol)
    }

    async fn eval(&self, tab: &TabId, expression: &str) -> Result<Value, DriverError> {
        let value = self
            .session_command(
                tab,
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(exception) = value.get("exceptionDetails") {
            return Err(DriverError::Protocol(format!("evaluate threw: {exception}")));
        }
        Ok(value
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), DriverError> {
        if let Some((_, state)) = self.tabs.remove(tab) {
            state.probing.store(false, Ordering::Relaxed);
            self.sessions.remove(&state.session_id);
        }
        self.drop_target(tab).await;
        Ok(())
    }

    fn probe_events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.probe_tx.subscribe()
    }
}

impl CdpDriver {
    async fn drop_target(&self, tab: &TabId) {
        if let Err(err) = self
            .transport
            .send_command(None, "Target.closeTarget", json!({ "targetId": tab.0 }))
            .await
        {
            debug!(target: "cdp-driver", %tab, ?err, "closeTarget failed");
        }
    }
}

/// Connection settings for the DevTools endpoint.
pub type DriverConfig = crate::transport::TransportConfig;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::mpsc;

    struct MockTransport {
        events: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
        calls: SyncMutex<Vec<(Option<String>, String)>>,
    }

    impl MockTransport {
        fn new() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(32);
            (
                Arc::new(Self {
                    events: tokio::sync::Mutex::new(rx),
                    calls: SyncMutex::new(Vec::new()),
                }),
                tx,
            )
        }

        fn called(&self, method: &str) -> bool {
            self.calls.lock().iter().any(|(_, m)| m == method)
        }
    }

    #[async_trait]
    impl CdpTransport for MockTransport {
        async fn next_event(&self) -> Option<TransportEvent> {
            self.events.lock().await.recv().await
        }

        async fn send_command(
            &self,
            session: Option<&str>,
            method: &str,
            _params: Value,
        ) -> Result<Value, DriverError> {
            self.calls
                .lock()
                .push((session.map(str::to_string), method.to_string()));
            let reply = match method {
                "Target.createTarget" => json!({ "targetId": "tab-1" }),
                "Target.attachToTarget" => json!({ "sessionId": "sess-1" }),
                "Network.getResponseBody" => {
                    json!({ "body": "eyJvayI6dHJ1ZX0=", "base64Encoded": true })
                }
                "Runtime.evaluate" => json!({ "result": { "value": null } }),
                _ => json!({}),
            };
            Ok(reply)
        }
    }

    async fn opened_driver() -> (Arc<CdpDriver>, Arc<MockTransport>, mpsc::Sender<TransportEvent>, TabId)
    {
        let (transport, events) = MockTransport::new();
        let driver = CdpDriver::new(transport.clone() as Arc<dyn CdpTransport>);
        driver.start();
        let tab = driver
            .open_tab("https://etsy.com/search?q=lamp", true)
            .await
            .expect("open tab");
        (driver, transport, events, tab)
    }

    fn response_event(session: &str, mime: &str) -> TransportEvent {
        TransportEvent {
            method: "Network.responseReceived".to_string(),
            params: json!({
                "requestId": "req-9",
                "response": { "url": "https://www.etsy.com/api/v3/search", "mimeType": mime }
            }),
            session_id: Some(session.to_string()),
        }
    }

    #[tokio::test]
    async fn open_and_attach_route_probe_events_to_tab() {
        let (driver, transport, events, tab) = opened_driver().await;
        driver.attach(&tab).await.expect("attach");
        assert!(transport.called("Network.enable"));

        let mut probe = driver.probe_events();
        events
            .send(response_event("sess-1", "application/json"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), probe.recv())
            .await
            .expect("probe event in time")
            .expect("probe event");
        assert_eq!(event.tab, tab);
        assert_eq!(event.request_id, "req-9");
        assert!(event.mime_type.contains("json"));
    }

    #[tokio::test]
    async fn unattached_tab_emits_no_probe_events() {
        let (driver, _transport, events, _tab) = opened_driver().await;
        let mut probe = driver.probe_events();
        events
            .send(response_event("sess-1", "application/json"))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), probe.recv()).await;
        assert!(result.is_err(), "event leaked through detached probe");
    }

    #[tokio::test]
    async fn detach_silences_the_probe() {
        let (driver, _transport, events, tab) = opened_driver().await;
        driver.attach(&tab).await.unwrap();
        driver.detach(&tab).await.unwrap();

        let mut probe = driver.probe_events();
        events
            .send(response_event("sess-1", "application/json"))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), probe.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn load_event_wakes_waiters() {
        let (driver, _transport, events, tab) = opened_driver().await;
        let waiter = {
            let driver = Arc::clone(&driver);
            let tab = tab.clone();
            tokio::spawn(async move { driver.wait_for_load(&tab, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        events
            .send(TransportEvent {
                method: "Page.loadEventFired".to_string(),
                params: json!({}),
                session_id: Some("sess-1".to_string()),
            })
            .await
            .unwrap();
        waiter.await.unwrap().expect("load observed");
    }

    #[tokio::test]
    async fn body_text_decodes_base64_transport() {
        let (driver, _transport, _events, tab) = opened_driver().await;
        let body = driver.fetch_response_body(&tab, "req-9").await.unwrap();
        assert!(body.base64_encoded);
        assert_eq!(body.text().unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn close_tab_forgets_the_session() {
        let (driver, transport, events, tab) = opened_driver().await;
        driver.attach(&tab).await.unwrap();
        driver.close_tab(&tab).await.unwrap();
        assert!(transport.called("Target.closeTarget"));

        let mut probe = driver.probe_events();
        events
            .send(response_event("sess-1", "application/json"))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), probe.recv()).await;
        assert!(result.is_err());
        assert!(matches!(
            driver.eval(&tab, "1").await,
            Err(DriverError::UnknownTab(_))
        ));
    }
}
