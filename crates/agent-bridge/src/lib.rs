//! Agent-facing transport. Maintains one WebSocket to the agent endpoint
//! with quadratic-backoff reconnect, buffers event frames in a FIFO outbox
//! while disconnected, and demultiplexes request envelopes into the control
//! port — every `agent-message` gets exactly one `extension-response`.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tabpilot_core_types::backoff::reconnect_delay;
use tabpilot_core_types::BridgeStatus;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The kernel surface the bridge dispatches into.
#[async_trait]
pub trait ControlPort: Send + Sync {
    /// Handle one control payload (`enqueueCommand`, `getExtensionState`,
    /// `toggleAgentControl`, `exportData`, …). Must always return a reply
    /// value, never fail.
    async fn dispatch(&self, payload: Value) -> Value;
    /// Current `extensionState` payload for the on-connect snapshot.
    async fn state_snapshot(&self) -> Value;
    /// Inbound `NEXT_JOB` frame from the agent's job queue.
    async fn next_job(&self, frame: Value);
}

pub struct AgentBridge {
    event_tx: mpsc::UnboundedSender<Value>,
    status_rx: watch::Receiver<BridgeStatus>,
}

impl AgentBridge {
    /// Spawn the connection loop against `endpoint`.
    pub fn spawn(endpoint: String, control: Arc<dyn ControlPort>) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BridgeStatus::Disconnected);
        tokio::spawn(run_loop(endpoint, control, event_rx, status_tx));
        Arc::new(Self {
            event_tx,
            status_rx,
        })
    }

    /// Queue an event frame (`commandResult`, `extensionState`, job polls).
    /// Frames survive disconnects and flush FIFO on the next open.
    pub fn emit(&self, frame: Value) {
        if self.event_tx.send(frame).is_err() {
            warn!(target: "bridge", "bridge loop gone, event dropped");
        }
    }

    /// Ask the agent for the next queued job.
    pub fn request_next_job(&self) {
        self.emit(json!({
            "type": "GET_NEXT_JOB",
            "requestId": uuid::Uuid::new_v4().to_string(),
        }));
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_rx.clone()
    }
}

async fn run_loop(
    endpoint: String,
    control: Arc<dyn ControlPort>,
    mut event_rx: mpsc::UnboundedReceiver<Value>,
    status_tx: watch::Sender<BridgeStatus>,
) {
    // Frames that failed mid-send; drained before the event channel.
    let mut outbox: VecDeque<String> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        let _ = status_tx.send(BridgeStatus::Connecting);
        match connect_async(&endpoint).await {
            Ok((ws, _)) => {
                info!(target: "bridge", endpoint = %endpoint, "agent bridge connected");
                attempt = 0;
                let _ = status_tx.send(BridgeStatus::Connected);
                let (mut sink, mut stream) = ws.split();

                // Snapshot first so buffered results land after fresh state.
                let snapshot = json!({
                    "type": "extensionState",
                    "payload": control.state_snapshot().await,
                });
                if sink.send(Message::Text(snapshot.to_string())).await.is_err() {
                    warn!(target: "bridge", "snapshot send failed");
                } else {
                    'connected: loop {
                        while let Some(frame) = outbox.pop_front() {
                            if let Err(err) = sink.send(Message::Text(frame.clone())).await {
                                warn!(target: "bridge", %err, "event send failed, requeueing");
                                outbox.push_front(frame);
                                break 'connected;
                            }
                        }

                        tokio::select! {
                            event = event_rx.recv() => {
                                match event {
                                    Some(value) => {
                                        let frame = value.to_string();
                                        if let Err(err) = sink.send(Message::Text(frame.clone())).await {
                                            warn!(target: "bridge", %err, "event send failed, requeueing");
                                            outbox.push_front(frame);
                                            break 'connected;
                                        }
                                    }
                                    None => return,
                                }
                            }
                            frame = stream.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        if !handle_inbound(&control, &mut sink, &text).await {
                                            break 'connected;
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        if sink.send(Message::Pong(payload)).await.is_err() {
                                            break 'connected;
                                        }
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        debug!(target: "bridge", ?frame, "agent closed the connection");
                                        break 'connected;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(err)) => {
                                        warn!(target: "bridge", %err, "transport error");
                                        break 'connected;
                                    }
                                    None => break 'connected,
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                debug!(target: "bridge", endpoint = %endpoint, %err, "agent endpoint unreachable");
            }
        }

        let _ = status_tx.send(BridgeStatus::Disconnected);
        attempt += 1;
        tokio::time::sleep(reconnect_delay(attempt)).await;
    }
}

/// Route one inbound frame. Returns false when the connection should drop.
async fn handle_inbound(control: &Arc<dyn ControlPort>, sink: &mut WsSink, text: &str) -> bool {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "bridge", %err, "unparseable inbound frame");
            return true;
        }
    };

    if message.get("envelope").and_then(Value::as_str) == Some("agent-message") {
        let request_id = message
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);
        let result = control.dispatch(payload).await;
        let response = json!({
            "envelope": "extension-response",
            "requestId": request_id,
            "payload": result,
        });
        return sink.send(Message::Text(response.to_string())).await.is_ok();
    }

    if message.get("type").and_then(Value::as_str) == Some("NEXT_JOB") {
        control.next_job(message).await;
        return true;
    }

    debug!(target: "bridge", frame = %text, "unhandled inbound frame");
    true
}
