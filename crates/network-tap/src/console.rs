//! Page console output that looks chat related.
//!
//! Matching lines are always logged. A matching line whose text is a JSON object or array is
//! also handed to the capture core, since some players log the chat messages they render.

use std::sync::atomic::{AtomicBool, Ordering};

use cdp_adapter::{EventFilter, EventRouter, Subscription, TransportEvent};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{PayloadSink, RawMessage};

pub struct ConsoleWatcher {
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ConsoleWatcher {
    pub fn attach(
        router: &EventRouter,
        session_id: &str,
        keywords: &[String],
        sink: PayloadSink,
    ) -> Self {
        let subscription = router.subscribe(
            EventFilter::methods(["Runtime.consoleAPICalled"]).for_session(session_id),
        );
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Self::pump(subscription, keywords, sink, cancel.clone()));

        Self {
            cancel,
            pump: Mutex::new(Some(pump)),
            stopped: AtomicBool::new(false),
        }
    }

    async fn pump(
        mut subscription: Subscription,
        keywords: Vec<String>,
        sink: PayloadSink,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => {
                        if let Some(message) = Self::inspect(&keywords, event) {
                            sink.offer(message);
                        }
                    }
                    None => break,
                },
            }
        }
    }

    fn inspect(keywords: &[String], event: TransportEvent) -> Option<RawMessage> {
        let Some(text) = console_text(&event.params) else {
            debug!(target: "network-tap", "unreadable console event dropped");
            return None;
        };
        let lowered = text.to_lowercase();
        if !keywords.iter().any(|k| lowered.contains(k.as_str())) {
            return None;
        }
        info!(target: "network-tap", text = %text, "console message");

        let payload = match serde_json::from_str::<Value>(text.trim()) {
            Ok(payload @ (Value::Object(_) | Value::Array(_))) => payload,
            _ => return None,
        };
        let url = event
            .params
            .pointer("/stackTrace/callFrames/0/url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(RawMessage::ConsoleMessage { url, payload })
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
    }
}

/// Join the console call arguments the way DevTools prints them.
fn console_text(params: &Value) -> Option<String> {
    let args = params.get("args")?.as_array()?;
    let parts: Vec<String> = args
        .iter()
        .filter_map(|arg| match arg.get("value") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
            None => arg
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect();
    Some(parts.join(" "))
}
