//! Write-mostly channel to the records sink. Each record is one JSON frame;
//! frames queue while the sink is unreachable and flush in order on
//! reconnect. Inbound frames are ignored.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use tabpilot_core_types::backoff::reconnect_delay;

/// Floor applied to the reconnect delay for the data sink.
const MIN_RECONNECT: Duration = Duration::from_secs(2);

/// Where the executor hands records off.
pub trait RecordSink: Send + Sync {
    fn stream(&self, record: Value);
    /// The sink is live-streaming; export acknowledges that a task finished.
    fn export(&self);
}

pub struct DataStreamer {
    out_tx: mpsc::UnboundedSender<Value>,
    exports: AtomicU64,
}

impl DataStreamer {
    /// Spawn the streamer's connection loop against `endpoint`.
    pub fn spawn(endpoint: String) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(endpoint, out_rx));
        Arc::new(Self {
            out_tx,
            exports: AtomicU64::new(0),
        })
    }

    pub fn export_count(&self) -> u64 {
        self.exports.load(Ordering::Relaxed)
    }
}

impl RecordSink for DataStreamer {
    fn stream(&self, record: Value) {
        if self.out_tx.send(record).is_err() {
            warn!(target: "data-stream", "streamer loop gone, record dropped");
        }
    }

    fn export(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
        info!(target: "data-stream", "export requested; sink is live-streaming");
    }
}

async fn run_loop(endpoint: String, mut out_rx: mpsc::UnboundedReceiver<Value>) {
    // Frames that failed mid-send; drained before the channel.
    let mut outbox: VecDeque<String> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        match connect_async(&endpoint).await {
            Ok((ws, _)) => {
                info!(target: "data-stream", endpoint = %endpoint, "data sink connected");
                attempt = 0;
                let (mut sink, mut stream) = ws.split();

                'connected: loop {
                    while let Some(frame) = outbox.pop_front() {
                        if let Err(err) = sink.send(Message::Text(frame.clone())).await {
                            warn!(target: "data-stream", %err, "send failed, requeueing");
                            outbox.push_front(frame);
                            break 'connected;
                        }
                    }

                    tokio::select! {
                        record = out_rx.recv() => {
                            match record {
                                Some(value) => {
                                    let frame = value.to_string();
                                    if let Err(err) = sink.send(Message::Text(frame.clone())).await {
                                        warn!(target: "data-stream", %err, "send failed, requeueing");
                                        outbox.push_front(frame);
                                        break 'connected;
                                    }
                                }
                                None => return,
                            }
                        }
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'connected,
                                Some(Ok(_)) => {} // write-only: inbound ignored
                            }
                        }
                    }
                }
            }
            Err(err) => {
                debug!(target: "data-stream", endpoint = %endpoint, %err, "data sink unreachable");
            }
        }

        attempt += 1;
        tokio::time::sleep(reconnect_delay(attempt).max(MIN_RECONNECT)).await;
    }
}
