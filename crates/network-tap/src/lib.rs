//! Traffic taps for a single capture page.
//!
//! Each tap holds a cancellable router subscription on the page's CDP session and turns browser
//! events into [`RawMessage`]s for the capture core. Handlers never block page traffic and never
//! let a failure escape: anything that goes wrong is logged and the payload is dropped.

pub mod activity;
pub mod classify;
pub mod config;
pub mod console;
pub mod interceptor;
pub mod metrics;
pub mod socket;

use cdp_adapter::AdapterError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use activity::{ActivityMonitor, ActivitySnapshot};
pub use classify::{Classifier, DEFAULT_KEYWORDS};
pub use config::TapConfig;
pub use console::ConsoleWatcher;
pub use interceptor::TrafficInterceptor;
pub use socket::{ConnectionStats, SocketListener};

/// Where a decoded payload was observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadOrigin {
    Network,
    Socket,
    Console,
}

impl PayloadOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadOrigin::Network => "network",
            PayloadOrigin::Socket => "socket",
            PayloadOrigin::Console => "console",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Sent,
    Received,
}

/// A decoded JSON payload on its way to an extractor. Never persisted.
#[derive(Clone, Debug)]
pub enum RawMessage {
    NetworkResponse {
        url: String,
        payload: Value,
    },
    SocketFrame {
        url: String,
        direction: FrameDirection,
        payload: Value,
    },
    /// JSON logged to the page console. `url` is the script that logged it, when known.
    ConsoleMessage {
        url: String,
        payload: Value,
    },
}

impl RawMessage {
    pub fn origin(&self) -> PayloadOrigin {
        match self {
            RawMessage::NetworkResponse { .. } => PayloadOrigin::Network,
            RawMessage::SocketFrame { .. } => PayloadOrigin::Socket,
            RawMessage::ConsoleMessage { .. } => PayloadOrigin::Console,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            RawMessage::NetworkResponse { url, .. }
            | RawMessage::SocketFrame { url, .. }
            | RawMessage::ConsoleMessage { url, .. } => url,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            RawMessage::NetworkResponse { payload, .. }
            | RawMessage::SocketFrame { payload, .. }
            | RawMessage::ConsoleMessage { payload, .. } => payload,
        }
    }
}

/// Errors emitted by the tap surface.
#[derive(Clone, Debug, Error)]
pub enum TapError {
    #[error("cdp command failed: {0}")]
    Cdp(#[from] AdapterError),
    #[error("malformed cdp event: {0}")]
    MalformedEvent(String),
    #[error("response body unavailable: {0}")]
    Body(String),
}

/// Bounded hand-off from tap handlers to the capture loop.
#[derive(Clone)]
pub struct PayloadSink {
    tx: mpsc::Sender<RawMessage>,
}

impl PayloadSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hand a payload over without waiting. Returns `false` when it was dropped.
    pub fn offer(&self, message: RawMessage) -> bool {
        let origin = message.origin();
        match self.tx.try_send(message) {
            Ok(()) => {
                metrics::record_forwarded(origin);
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                metrics::record_dropped(origin);
                warn!(
                    target: "network-tap",
                    origin = origin.as_str(),
                    url = %message.url(),
                    "payload channel full; payload dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "network-tap", "payload channel closed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sink_drops_when_full() {
        let (sink, mut rx) = PayloadSink::channel(1);
        let first = RawMessage::NetworkResponse {
            url: "https://a/im/fetch".into(),
            payload: json!({"n": 1}),
        };
        let second = RawMessage::SocketFrame {
            url: "wss://a/push".into(),
            direction: FrameDirection::Received,
            payload: json!({"n": 2}),
        };
        assert!(sink.offer(first));
        assert!(!sink.offer(second));

        let got = rx.try_recv().expect("first payload");
        assert_eq!(got.origin(), PayloadOrigin::Network);
        assert_eq!(got.payload()["n"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (sink, rx) = PayloadSink::channel(4);
        drop(rx);
        assert!(!sink.offer(RawMessage::NetworkResponse {
            url: String::new(),
            payload: Value::Null,
        }));
    }
}
