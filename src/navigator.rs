//! Room loading and the post-load liveness check.

use std::time::Duration;

use cdp_adapter::{EventRouter, PageHandle};
use network_tap::{ActivityMonitor, TapConfig};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CaptureSettings;
use crate::errors::CaptureError;
use crate::platform::PlatformProfile;

const READY_POLL: Duration = Duration::from_millis(100);

/// What the page looked like once it settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomStatus {
    pub url: String,
    pub ended: bool,
    /// `None` when the platform has no comment-area selector.
    pub comment_area_found: Option<bool>,
}

pub struct Navigator<'a> {
    page: &'a PageHandle,
    router: &'a EventRouter,
    profile: &'a dyn PlatformProfile,
    settings: &'a CaptureSettings,
    tap: &'a TapConfig,
}

impl<'a> Navigator<'a> {
    pub fn new(
        page: &'a PageHandle,
        router: &'a EventRouter,
        profile: &'a dyn PlatformProfile,
        settings: &'a CaptureSettings,
        tap: &'a TapConfig,
    ) -> Self {
        Self {
            page,
            router,
            profile,
            settings,
            tap,
        }
    }

    /// Load the room and inspect it. `Ok(None)` means `cancel` fired first.
    pub async fn open_room(
        &self,
        room_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RoomStatus>, CaptureError> {
        let url = self.profile.resolve_room_url(room_id).await?;
        info!(target: "danmaku-capture", "Opening live room: {url}");

        let monitor = ActivityMonitor::attach(
            self.router,
            self.page.session_id(),
            Duration::from_millis(self.tap.idle_poll_ms),
        );
        let loaded = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.load(&url, &monitor) => Some(result),
        };
        monitor.stop().await;
        match loaded {
            None => return Ok(None),
            Some(result) => result?,
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = sleep(self.settings.render_grace()) => {}
        }

        Ok(Some(self.inspect(url).await))
    }

    async fn load(&self, url: &str, monitor: &ActivityMonitor) -> Result<(), CaptureError> {
        let deadline = Instant::now() + self.settings.navigation_timeout();

        let response = self
            .page
            .command("Page.navigate", json!({ "url": url }))
            .await
            .map_err(|err| CaptureError::Navigation(format!("{url}: {err}")))?;
        if let Some(text) = response
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Err(CaptureError::Navigation(format!("{url}: {text}")));
        }

        self.wait_ready(url, deadline).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !monitor
            .wait_for_idle(self.settings.idle_window(), remaining)
            .await
        {
            warn!(
                target: "danmaku-capture",
                activity = ?monitor.snapshot(),
                "network never went idle; continuing"
            );
        }
        Ok(())
    }

    async fn wait_ready(&self, url: &str, deadline: Instant) -> Result<(), CaptureError> {
        loop {
            match self.page.evaluate("document.readyState").await {
                Ok(Value::String(state)) if state == "interactive" || state == "complete" => {
                    return Ok(());
                }
                Ok(other) => debug!(target: "danmaku-capture", state = %other, "page not ready yet"),
                Err(err) => debug!(target: "danmaku-capture", %err, "readyState check failed"),
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::Navigation(format!(
                    "{url}: timed out waiting for document ready"
                )));
            }
            sleep(READY_POLL).await;
        }
    }

    async fn inspect(&self, url: String) -> RoomStatus {
        let markers = serde_json::to_string(self.profile.ended_markers()).unwrap_or_default();
        let ended_check = format!(
            "(() => {{ const text = document.body ? document.body.innerText : ''; \
             return {markers}.some((marker) => text.includes(marker)); }})()"
        );
        let ended = match self.page.evaluate(&ended_check).await {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(err) => {
                warn!(target: "danmaku-capture", %err, "failed to check live room status");
                false
            }
        };

        let comment_area_found = match self.profile.comment_area_selector() {
            Some(selector) => {
                let query = format!(
                    "document.querySelector({}) !== null",
                    Value::String(selector.to_string())
                );
                let found = match self.page.evaluate(&query).await {
                    Ok(value) => value.as_bool().unwrap_or(false),
                    Err(err) => {
                        debug!(target: "danmaku-capture", %err, "comment area check failed");
                        false
                    }
                };
                if !found {
                    warn!(
                        target: "danmaku-capture",
                        selector,
                        "comment area not found; the page may need manual handling"
                    );
                }
                Some(found)
            }
            None => None,
        };

        if ended {
            warn!(target: "danmaku-capture", "live room has ended");
        } else {
            info!(target: "danmaku-capture", "live room loaded");
        }

        RoomStatus {
            url,
            ended,
            comment_area_found,
        }
    }
}
