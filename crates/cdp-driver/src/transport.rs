use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DriverError;

/// One DevTools event as it came off the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Raw DevTools access: fire a method, stream events.
#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError>;
}

/// Transport that yields nothing; placeholder for wiring without a browser.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _session: Option<&str>,
        method: &str,
        _params: Value,
    ) -> Result<Value, DriverError> {
        Err(DriverError::Io(format!("no browser connection for {method}")))
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// DevTools endpoint of an already-running browser
    /// (`ws://host:9222/devtools/browser/...`).
    pub websocket_url: String,
    pub default_deadline: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_url: "ws://127.0.0.1:9222/devtools/browser".to_string(),
            default_deadline: Duration::from_secs(10),
        }
    }
}

/// Transport over a live chromium DevTools connection. The pump loop owns
/// the connection; commands are correlated to responses by call id.
pub struct ChromiumTransport {
    cfg: TransportConfig,
    state: Mutex<Option<Arc<RuntimeState>>>,
}

impl ChromiumTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(None),
        }
    }

    async fn runtime(&self) -> Result<Arc<RuntimeState>, DriverError> {
        let mut guard = self.state.lock().await;
        if let Some(runtime) = guard.as_ref() {
            if runtime.is_alive() {
                return Ok(Arc::clone(runtime));
            }
        }
        let runtime = Arc::new(RuntimeState::connect(&self.cfg).await?);
        *guard = Some(Arc::clone(&runtime));
        Ok(runtime)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        match self.runtime().await {
            Ok(runtime) => runtime.next_event().await,
            Err(err) => {
                warn!(target: "cdp-driver", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let runtime = self.runtime().await?;
        runtime
            .send(session, method, params, self.cfg.default_deadline)
            .await
    }
}

struct ControlMessage {
    session: Option<String>,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, DriverError>>,
}

struct RuntimeState {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    loop_task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl RuntimeState {
    async fn connect(cfg: &TransportConfig) -> Result<Self, DriverError> {
        let conn = Connection::<CdpEventMessage>::connect(&cfg.websocket_url)
            .await
            .map_err(|err| DriverError::io(err))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = Arc::clone(&alive);

        let loop_task = tokio::spawn(async move {
            if let Err(err) = Self::run_loop(conn, command_rx, events_tx).await {
                error!(target: "cdp-driver", ?err, "transport loop terminated with error");
            }
            loop_alive.store(false, Ordering::Relaxed);
        });

        info!(target: "cdp-driver", url = %cfg.websocket_url, "devtools connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn send(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            session: session.map(str::to_string),
            method: method.to_string(),
            params,
            responder: resp_tx,
        };
        self.command_tx
            .send(message)
            .await
            .map_err(|err| DriverError::io(err))?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::Io("command response channel closed".into())),
            Err(_) => Err(DriverError::Timeout(format!("{method} timed out"))),
        }
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), DriverError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    let method_id: MethodId = cmd.method.clone().into();
                    let session = cmd.session.clone().map(CdpSessionId::from);
                    match conn.submit_command(method_id, session, cmd.params) {
                        Ok(call_id) => {
                            inflight.insert(call_id, cmd.responder);
                        }
                        Err(err) => {
                            let _ = cmd.responder.send(Err(DriverError::io(err)));
                        }
                    }
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::handle_response(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            match TryInto::<CdpJsonEventMessage>::try_into(event) {
                                Ok(raw) => {
                                    let payload = TransportEvent {
                                        method: raw.method.into_owned(),
                                        params: raw.params,
                                        session_id: raw.session_id,
                                    };
                                    if event_tx.send(payload).await.is_err() {
                                        debug!(target: "cdp-driver", "event consumer gone, stopping pump");
                                        return Ok(());
                                    }
                                }
                                Err(err) => {
                                    warn!(target: "cdp-driver", ?err, "undecodable cdp event");
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let failure = DriverError::io(&err);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(failure.clone()));
                            }
                            return Err(failure);
                        }
                        None => {
                            let failure = DriverError::Io("devtools connection closed".into());
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(failure.clone()));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_response(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>>,
    ) {
        let Some(sender) = inflight.remove(&resp.id) else {
            return;
        };
        let result = if let Some(result) = resp.result {
            Ok(result)
        } else if let Some(error) = resp.error {
            Err(DriverError::Protocol(format!(
                "cdp error {}: {}",
                error.code, error.message
            )))
        } else {
            Err(DriverError::Protocol("empty cdp response".into()))
        };
        let _ = sender.send(result);
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}
