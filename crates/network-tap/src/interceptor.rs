//! Observation-only request interception over the CDP `Fetch` domain.
//!
//! Every request pauses at the request stage. Unmatched requests are continued right away.
//! Chat-relevant requests are continued with response interception, so the browser performs
//! the one and only fetch and the body is read at the response stage before it is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cdp_adapter::{EventFilter, EventRouter, PageHandle, Subscription, TransportEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::classify::Classifier;
use crate::config::TapConfig;
use crate::{metrics, PayloadOrigin, PayloadSink, RawMessage, TapError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PausedRequest {
    request_id: String,
    request: PausedRequestInfo,
    #[serde(default)]
    response_status_code: Option<i64>,
    #[serde(default)]
    response_error_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PausedRequestInfo {
    url: String,
}

impl PausedRequest {
    fn at_response_stage(&self) -> bool {
        self.response_status_code.is_some() || self.response_error_reason.is_some()
    }

    fn succeeded(&self) -> bool {
        self.response_error_reason.is_none()
            && matches!(self.response_status_code, Some(200..=299))
    }
}

struct Handler {
    page: PageHandle,
    classifier: Classifier,
    sink: PayloadSink,
}

impl Handler {
    async fn on_paused(&self, event: TransportEvent) {
        metrics::record_paused();
        let request_id = event
            .params
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Err(err) = self.handle(event.params).await {
            metrics::record_handler_failure();
            warn!(target: "network-tap", %err, "interception handler failed; continuing request");
            if let Some(request_id) = request_id {
                if let Err(err) = self.continue_request(&request_id, false).await {
                    debug!(target: "network-tap", %err, request_id, "fallback continue failed");
                }
            }
        }
    }

    async fn handle(&self, params: Value) -> Result<(), TapError> {
        let paused: PausedRequest = serde_json::from_value(params)
            .map_err(|err| TapError::MalformedEvent(err.to_string()))?;

        if paused.at_response_stage() {
            if paused.succeeded() {
                match self.read_json_body(&paused.request_id).await {
                    Ok(Some(payload)) => {
                        self.sink.offer(RawMessage::NetworkResponse {
                            url: paused.request.url.clone(),
                            payload,
                        });
                    }
                    Ok(None) => {
                        metrics::record_decode_failure(PayloadOrigin::Network);
                        debug!(target: "network-tap", url = %paused.request.url, "response body is not json");
                    }
                    Err(err) => {
                        debug!(target: "network-tap", %err, url = %paused.request.url, "skipping response body");
                    }
                }
            }
            return self.continue_request(&paused.request_id, false).await;
        }

        match self.classifier.matched(&paused.request.url) {
            Some(keyword) => {
                metrics::record_matched();
                debug!(target: "network-tap", url = %paused.request.url, keyword, "chat-relevant request");
                self.continue_request(&paused.request_id, true).await
            }
            None => self.continue_request(&paused.request_id, false).await,
        }
    }

    async fn continue_request(
        &self,
        request_id: &str,
        intercept_response: bool,
    ) -> Result<(), TapError> {
        let mut params = json!({ "requestId": request_id });
        if intercept_response {
            params["interceptResponse"] = json!(true);
        }
        self.page.command("Fetch.continueRequest", params).await?;
        Ok(())
    }

    async fn read_json_body(&self, request_id: &str) -> Result<Option<Value>, TapError> {
        let body = self
            .page
            .command(
                "Fetch.getResponseBody",
                json!({ "requestId": request_id }),
            )
            .await
            .map_err(|err| TapError::Body(err.to_string()))?;

        let text = body.get("body").and_then(Value::as_str).unwrap_or_default();
        let encoded = body
            .get("base64Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let bytes = if encoded {
            STANDARD
                .decode(text)
                .map_err(|err| TapError::Body(format!("invalid base64 body: {err}")))?
        } else {
            text.as_bytes().to_vec()
        };

        Ok(serde_json::from_slice(&bytes).ok())
    }
}

pub struct TrafficInterceptor {
    page: PageHandle,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pump: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
    stopped: AtomicBool,
}

impl TrafficInterceptor {
    pub async fn attach(
        page: PageHandle,
        router: &EventRouter,
        classifier: Classifier,
        sink: PayloadSink,
        cfg: &TapConfig,
    ) -> Result<Self, TapError> {
        // Subscribe first so no paused request slips past between enable and listen.
        // A dropped pause would stall its request for good, so the route never drops.
        let subscription = router.subscribe(
            EventFilter::methods(["Fetch.requestPaused"])
                .for_session(page.session_id())
                .lossless(),
        );

        page.command(
            "Fetch.enable",
            json!({
                "patterns": [{ "urlPattern": "*", "requestStage": "Request" }],
                "handleAuthRequests": false,
            }),
        )
        .await?;

        let handler = Arc::new(Handler {
            page: page.clone(),
            classifier,
            sink,
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pump = tokio::spawn(Self::pump(
            subscription,
            handler,
            cancel.clone(),
            tracker.clone(),
        ));

        info!(target: "network-tap", session = %page.session_id(), "traffic interceptor attached");

        Ok(Self {
            page,
            cancel,
            tracker,
            pump: Mutex::new(Some(pump)),
            grace: Duration::from_millis(cfg.shutdown_grace_ms),
            stopped: AtomicBool::new(false),
        })
    }

    async fn pump(
        mut subscription: Subscription,
        handler: Arc<Handler>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => {
                        let handler = Arc::clone(&handler);
                        tracker.spawn(async move { handler.on_paused(event).await });
                    }
                    None => {
                        debug!(target: "network-tap", "interceptor subscription closed");
                        break;
                    }
                },
            }
        }
    }

    /// Stop taking new pauses, let running handlers release theirs, then disable `Fetch`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }

        self.tracker.close();
        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                target: "network-tap",
                pending = self.tracker.len(),
                "interception handlers still running after grace period"
            );
        }

        if let Err(err) = self.page.command("Fetch.disable", json!({})).await {
            debug!(target: "network-tap", %err, "Fetch.disable failed during stop");
        }
        info!(target: "network-tap", "traffic interceptor stopped");
    }
}
