//! One browser, one page. The capture core drives everything through this pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::router::EventRouter;
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget};

const SUBSCRIBER_BUFFER: usize = 1024;

/// Command handle for the single page a session controls.
#[derive(Clone)]
pub struct PageHandle {
    transport: Arc<dyn CdpTransport>,
    target_id: String,
    session_id: String,
}

impl PageHandle {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a command scoped to the page's CDP session.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
    }

    /// Evaluate an expression in the page and return its JSON value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, AdapterError> {
        let response = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("evaluate raised exception")
                .with_data(details.clone()));
        }

        Ok(response
            .get("result")
            .and_then(|res| res.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

pub struct BrowserSession {
    transport: Arc<dyn CdpTransport>,
    router: Arc<EventRouter>,
    page: PageHandle,
    owns_browser: bool,
    released: AtomicBool,
}

impl BrowserSession {
    /// Launch (or attach to) Chromium and prepare a single page.
    pub async fn acquire(cfg: CdpConfig) -> Result<Self, AdapterError> {
        let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::new(cfg.clone()));
        Self::acquire_with(transport, &cfg).await
    }

    pub async fn acquire_with(
        transport: Arc<dyn CdpTransport>,
        cfg: &CdpConfig,
    ) -> Result<Self, AdapterError> {
        if let Err(err) = transport.start().await {
            transport.shutdown().await;
            return Err(err.into_kind(AdapterErrorKind::Launch));
        }

        let router = Arc::new(EventRouter::spawn(Arc::clone(&transport), SUBSCRIBER_BUFFER));

        match Self::open_page(&transport, cfg).await {
            Ok(page) => {
                info!(
                    target: "cdp-adapter",
                    target_id = %page.target_id,
                    session_id = %page.session_id,
                    headless = cfg.headless,
                    "browser session ready"
                );
                Ok(Self {
                    transport,
                    router,
                    page,
                    owns_browser: cfg.websocket_url.is_none(),
                    released: AtomicBool::new(false),
                })
            }
            Err(err) => {
                router.shutdown().await;
                transport.shutdown().await;
                Err(err.into_kind(AdapterErrorKind::Launch))
            }
        }
    }

    async fn open_page(
        transport: &Arc<dyn CdpTransport>,
        cfg: &CdpConfig,
    ) -> Result<PageHandle, AdapterError> {
        let created = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("Target.createTarget returned no targetId")
            })?
            .to_string();

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("Target.attachToTarget returned no sessionId")
            })?
            .to_string();

        let page = PageHandle {
            transport: Arc::clone(transport),
            target_id,
            session_id,
        };

        for domain in ["Page.enable", "Runtime.enable", "Network.enable"] {
            page.command(domain, json!({})).await?;
        }

        let mut ua = serde_json::Map::new();
        ua.insert("userAgent".into(), Value::String(cfg.user_agent.clone()));
        if let Some(lang) = &cfg.accept_language {
            ua.insert("acceptLanguage".into(), Value::String(lang.clone()));
        }
        page.command("Emulation.setUserAgentOverride", Value::Object(ua))
            .await?;
        page.command(
            "Network.setExtraHTTPHeaders",
            json!({ "headers": { "User-Agent": cfg.user_agent } }),
        )
        .await?;

        Ok(page)
    }

    pub fn page(&self) -> &PageHandle {
        &self.page
    }

    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.router)
    }

    /// Cancelled when the browser connection goes away.
    pub fn disconnected(&self) -> CancellationToken {
        self.router.closed()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Close the page and the browser. Safe to call any number of times.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.closeTarget",
                json!({ "targetId": self.page.target_id }),
            )
            .await
        {
            debug!(target: "cdp-adapter", %err, "closeTarget failed during release");
        }

        if self.owns_browser {
            if let Err(err) = self
                .transport
                .send_command(CommandTarget::Browser, "Browser.close", json!({}))
                .await
            {
                debug!(target: "cdp-adapter", %err, "Browser.close failed during release");
            }
        }

        self.router.shutdown().await;
        self.transport.shutdown().await;
        info!(target: "cdp-adapter", "browser session released");
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            warn!(target: "cdp-adapter", "browser session dropped without release");
        }
    }
}
