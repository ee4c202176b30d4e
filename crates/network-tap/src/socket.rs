//! Websocket frame capture from the `Network.webSocket*` event family.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_adapter::{EventFilter, EventRouter, Subscription, TransportEvent};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{metrics, FrameDirection, PayloadOrigin, PayloadSink, RawMessage};

const TEXT_OPCODE: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub url: String,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Created {
    request_id: String,
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    request_id: String,
    response: FrameBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameBody {
    opcode: u8,
    #[serde(default)]
    payload_data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Closed {
    request_id: String,
}

type Connections = DashMap<String, ConnectionStats>;

pub struct SocketListener {
    connections: Arc<Connections>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SocketListener {
    pub fn attach(router: &EventRouter, session_id: &str, sink: PayloadSink) -> Self {
        let subscription = router.subscribe(
            EventFilter::methods([
                "Network.webSocketCreated",
                "Network.webSocketFrameSent",
                "Network.webSocketFrameReceived",
                "Network.webSocketClosed",
            ])
            .for_session(session_id),
        );

        let connections = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Self::pump(
            subscription,
            Arc::clone(&connections),
            sink,
            cancel.clone(),
        ));

        info!(target: "network-tap", session = session_id, "socket listener attached");

        Self {
            connections,
            cancel,
            pump: Mutex::new(Some(pump)),
            stopped: AtomicBool::new(false),
        }
    }

    async fn pump(
        mut subscription: Subscription,
        connections: Arc<Connections>,
        sink: PayloadSink,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => Self::handle(&connections, &sink, event),
                    None => {
                        debug!(target: "network-tap", "socket subscription closed");
                        break;
                    }
                },
            }
        }
    }

    fn handle(connections: &Connections, sink: &PayloadSink, event: TransportEvent) {
        match event.method.as_str() {
            "Network.webSocketCreated" => match serde_json::from_value::<Created>(event.params) {
                Ok(created) => {
                    info!(target: "network-tap", url = %created.url, "websocket connection");
                    connections.insert(
                        created.request_id,
                        ConnectionStats {
                            url: created.url,
                            ..ConnectionStats::default()
                        },
                    );
                }
                Err(err) => debug!(target: "network-tap", %err, "malformed webSocketCreated"),
            },
            "Network.webSocketFrameSent" => {
                Self::on_frame(connections, sink, FrameDirection::Sent, event)
            }
            "Network.webSocketFrameReceived" => {
                Self::on_frame(connections, sink, FrameDirection::Received, event)
            }
            "Network.webSocketClosed" => {
                if let Ok(closed) = serde_json::from_value::<Closed>(event.params) {
                    if let Some((_, stats)) = connections.remove(&closed.request_id) {
                        info!(
                            target: "network-tap",
                            url = %stats.url,
                            sent = stats.frames_sent,
                            received = stats.frames_received,
                            dropped = stats.frames_dropped,
                            "websocket closed"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn on_frame(
        connections: &Connections,
        sink: &PayloadSink,
        direction: FrameDirection,
        event: TransportEvent,
    ) {
        let frame = match serde_json::from_value::<Frame>(event.params) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "network-tap", %err, "malformed websocket frame event");
                return;
            }
        };

        if frame.response.opcode != TEXT_OPCODE {
            return;
        }

        // Connections opened before the listener attached show up here first.
        let mut stats = connections
            .entry(frame.request_id.clone())
            .or_insert_with(|| {
                debug!(target: "network-tap", request_id = %frame.request_id, "registering websocket lazily");
                ConnectionStats::default()
            });
        match direction {
            FrameDirection::Sent => stats.frames_sent += 1,
            FrameDirection::Received => stats.frames_received += 1,
        }

        match serde_json::from_str(&frame.response.payload_data) {
            Ok(payload) => {
                let url = stats.url.clone();
                drop(stats);
                sink.offer(RawMessage::SocketFrame {
                    url,
                    direction,
                    payload,
                });
            }
            Err(err) => {
                stats.frames_dropped += 1;
                metrics::record_decode_failure(PayloadOrigin::Socket);
                warn!(target: "network-tap", %err, url = %stats.url, "websocket text frame is not json");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, request_id: &str) -> Option<ConnectionStats> {
        self.connections.get(request_id).map(|entry| entry.clone())
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
        info!(
            target: "network-tap",
            open = self.connections.len(),
            "socket listener stopped"
        );
    }
}
