//! Kernel: composes the core components and implements the control surface
//! the agent bridge dispatches into.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use tabpilot_agent_bridge::{AgentBridge, ControlPort};
use tabpilot_core_types::ErrorCode;
use tabpilot_data_stream::RecordSink;
use tabpilot_executor::{CoreEvent, Executor};
use tabpilot_state_center::StateCenter;
use tabpilot_tab_registry::SessionRegistry;

/// How often the kernel pulls for agent-side jobs while idle.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct Kernel {
    state: Arc<StateCenter>,
    executor: Arc<Executor>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn RecordSink>,
    bridge: Mutex<Option<Arc<AgentBridge>>>,
}

impl Kernel {
    pub fn new(
        state: Arc<StateCenter>,
        executor: Arc<Executor>,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn RecordSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            executor,
            registry,
            sink,
            bridge: Mutex::new(None),
        })
    }

    /// Wire the bridge in and start the forwarding tasks: executor events
    /// become wire frames, bridge status lands in the state center, and the
    /// idle job poller runs.
    pub fn bind_bridge(self: &Arc<Self>, bridge: Arc<AgentBridge>) {
        *self.bridge.lock() = Some(Arc::clone(&bridge));

        // Executor events → event frames, in emission order.
        {
            let kernel = Arc::clone(self);
            let bridge = Arc::clone(&bridge);
            let mut events = kernel.executor.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        CoreEvent::CommandResult { command_id, result } => {
                            bridge.emit(json!({
                                "type": "commandResult",
                                "commandId": command_id,
                                "result": result,
                            }));
                        }
                        CoreEvent::StateChanged => {
                            bridge.emit(json!({
                                "type": "extensionState",
                                "payload": kernel.state.snapshot(),
                            }));
                        }
                    }
                }
            });
        }

        // Bridge status → state center.
        {
            let state = Arc::clone(&self.state);
            let mut status = bridge.watch_status();
            tokio::spawn(async move {
                loop {
                    state.set_bridge_status(*status.borrow_and_update());
                    if status.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        // Idle job poll: ask the agent for work when nothing is running.
        {
            let kernel = Arc::clone(self);
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(JOB_POLL_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let idle = !kernel.state.processing() && kernel.executor.queue_len() == 0;
                    if idle && kernel.state.agent_control_enabled() {
                        bridge.request_next_job();
                    }
                }
            });
        }
    }

    /// Suspend hook: abandon in-flight work, detach probes, persist state.
    pub async fn shutdown(&self) {
        info!(target: "kernel", "shutting down, clearing sessions");
        self.registry.cleanup_all().await;
        if let Err(err) = self.state.persist() {
            warn!(target: "kernel", %err, "final state persist failed");
        }
    }

    pub fn state(&self) -> &Arc<StateCenter> {
        &self.state
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }
}

#[async_trait]
impl ControlPort for Kernel {
    async fn dispatch(&self, payload: Value) -> Value {
        let verb = payload.get("type").and_then(Value::as_str).unwrap_or("");
        match verb {
            "enqueueCommand" => {
                let command = payload.get("command").cloned().unwrap_or(Value::Null);
                let verdict = self.executor.enqueue(&command);
                json!({ "ok": true, "result": verdict })
            }
            "getExtensionState" => {
                serde_json::to_value(self.state.snapshot()).unwrap_or_else(|_| json!({}))
            }
            "toggleAgentControl" => {
                let enabled = payload
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let settings = self.state.set_agent_control(enabled);
                if let Err(err) = self.state.persist() {
                    warn!(target: "kernel", %err, "settings persist failed");
                }
                info!(target: "kernel", enabled, "agent control toggled");
                json!({ "ok": true, "settings": settings })
            }
            "exportData" => {
                self.sink.export();
                json!({ "ok": true, "message": "data sink is live-streaming; export acknowledged" })
            }
            other => {
                warn!(target: "kernel", verb = other, "unknown control verb");
                json!({ "ok": false, "error": ErrorCode::UnknownMessageType.as_str() })
            }
        }
    }

    async fn state_snapshot(&self) -> Value {
        serde_json::to_value(self.state.snapshot()).unwrap_or_else(|_| json!({}))
    }

    async fn next_job(&self, frame: Value) {
        if frame.get("job_available").and_then(Value::as_bool) != Some(true) {
            return;
        }
        let Some(command) = frame.get("command") else {
            return;
        };
        let verdict = self.executor.enqueue(command);
        info!(
            target: "kernel",
            id = command.get("id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            status = ?verdict.status,
            "job pulled from agent"
        );
    }
}
