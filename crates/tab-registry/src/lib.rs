//! Tab session registry. A session exists exactly while the debugger probe
//! is attached to its tab; the harvest task buffers matching JSON response
//! bodies into the owning session until an explicit cleanup.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use tabpilot_cdp_driver::{ProbeEvent, TabDriver};
use tabpilot_core_types::{CaptureMode, Settings, TabId};

/// Poll interval for slot admission.
const SLOT_POLL: Duration = Duration::from_millis(500);

/// One buffered response body.
#[derive(Clone, Debug)]
pub struct CapturedBody {
    pub url: String,
    pub raw: String,
}

/// Capture state owned by a single command chain.
#[derive(Clone, Debug)]
pub struct Session {
    pub command_id: String,
    pub captured: Vec<CapturedBody>,
    pub capture_mode: CaptureMode,
    pub transformers: Vec<String>,
    pub settings: Settings,
}

impl Session {
    fn new(command_id: String, transformers: Vec<String>, settings: Settings) -> Self {
        Self {
            command_id,
            captured: Vec::new(),
            capture_mode: CaptureMode::Listings,
            transformers,
            settings,
        }
    }
}

pub struct SessionRegistry {
    driver: Arc<dyn TabDriver>,
    sessions: DashMap<TabId, Arc<Mutex<Session>>>,
    harvester: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(driver: Arc<dyn TabDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            sessions: DashMap::new(),
            harvester: Mutex::new(None),
        })
    }

    /// Start the harvest task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.harvester.lock();
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut events = registry.driver.probe_events();
            loop {
                match events.recv().await {
                    Ok(event) => registry.harvest(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "tab-registry", missed, "probe event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Buffer one response body if the event matches a live session's
    /// interest filter (JSON mime + host substring).
    async fn harvest(&self, event: ProbeEvent) {
        let Some(session) = self.get(&event.tab) else {
            return;
        };
        let host_filter = session.lock().settings.capture_host_filter.clone();
        if !event.mime_type.contains("json") || !event.url.contains(&host_filter) {
            return;
        }
        match self.driver.fetch_response_body(&event.tab, &event.request_id).await {
            Ok(body) => match body.text() {
                Ok(raw) => {
                    debug!(target: "tab-registry", tab = %event.tab, url = %event.url, bytes = raw.len(), "captured response body");
                    session.lock().captured.push(CapturedBody {
                        url: event.url,
                        raw,
                    });
                }
                Err(err) => {
                    warn!(target: "tab-registry", tab = %event.tab, %err, "body decode failed, skipping");
                }
            },
            Err(err) => {
                warn!(target: "tab-registry", tab = %event.tab, %err, "body fetch failed, skipping");
            }
        }
    }

    /// Block cooperatively until a session slot is free.
    pub async fn reserve_slot(&self, max_concurrent: usize) {
        loop {
            if self.sessions.len() < max_concurrent.max(1) {
                return;
            }
            sleep(SLOT_POLL).await;
        }
    }

    pub fn open_session(
        &self,
        tab: TabId,
        command_id: impl Into<String>,
        transformers: Vec<String>,
        settings: Settings,
    ) {
        self.sessions.insert(
            tab,
            Arc::new(Mutex::new(Session::new(
                command_id.into(),
                transformers,
                settings,
            ))),
        );
    }

    pub fn get(&self, tab: &TabId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(tab).map(|entry| Arc::clone(entry.value()))
    }

    /// Switch what the session is harvesting for without touching the buffer.
    pub fn set_capture_mode(&self, tab: &TabId, mode: CaptureMode) {
        if let Some(session) = self.get(tab) {
            session.lock().capture_mode = mode;
        }
    }

    pub fn captured_bodies(&self, tab: &TabId) -> Vec<CapturedBody> {
        self.get(tab)
            .map(|session| session.lock().captured.clone())
            .unwrap_or_default()
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Detach the probe, drop the session and optionally close the tab.
    /// Every step is best-effort; calling again is a no-op.
    pub async fn cleanup(&self, tab: &TabId, close_tab: bool) {
        let existed = self.sessions.remove(tab).is_some();
        if let Err(err) = self.driver.detach(tab).await {
            debug!(target: "tab-registry", %tab, %err, "probe detach failed");
        }
        if close_tab {
            if let Err(err) = self.driver.close_tab(tab).await {
                debug!(target: "tab-registry", %tab, %err, "tab close failed");
            }
        }
        if existed {
            debug!(target: "tab-registry", %tab, close_tab, "session cleaned up");
        }
    }

    /// Suspend hook: tear down every live session.
    pub async fn cleanup_all(&self) {
        let tabs: Vec<TabId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for tab in tabs {
            self.cleanup(&tab, true).await;
        }
    }
}
