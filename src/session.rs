//! The capture supervisor: one browser, one room, one output file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{AdapterError, BrowserSession, CdpConfig};
use network_tap::{
    Classifier, ConsoleWatcher, PayloadSink, RawMessage, SocketListener, TrafficInterceptor,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, EndedPolicy};
use crate::errors::CaptureError;
use crate::logging::SessionLog;
use crate::model::{Comment, Platform};
use crate::navigator::Navigator;
use crate::platform::{profile_for, PlatformProfile};
use crate::store::{default_output_path, CommentStore, SnapshotPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Navigating,
    Monitoring,
    ShuttingDown,
    Closed,
}

/// How a session that did not fail came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Cancelled,
    StreamEnded,
}

#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub platform: Platform,
    pub room_id: String,
    pub output: Option<PathBuf>,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &CdpConfig) -> Result<BrowserSession, AdapterError>;
}

/// Launches (or attaches to) a real Chromium.
pub struct ChromeLauncher;

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, config: &CdpConfig) -> Result<BrowserSession, AdapterError> {
        BrowserSession::acquire(config.clone()).await
    }
}

#[derive(Default)]
struct Taps {
    interceptor: Option<TrafficInterceptor>,
    socket: Option<SocketListener>,
    console: Option<ConsoleWatcher>,
}

impl Taps {
    async fn stop(&mut self) {
        if let Some(interceptor) = self.interceptor.take() {
            interceptor.stop().await;
        }
        if let Some(socket) = self.socket.take() {
            socket.stop().await;
        }
        if let Some(console) = self.console.take() {
            console.stop().await;
        }
    }
}

pub struct CaptureSession {
    platform: Platform,
    room_id: String,
    profile: Arc<dyn PlatformProfile>,
    config: AppConfig,
    launcher: Arc<dyn BrowserLauncher>,
    store: CommentStore,
    policy: SnapshotPolicy,
    browser: Option<BrowserSession>,
    taps: Taps,
    log: SessionLog,
    state_tx: watch::Sender<SessionState>,
    cleaned: bool,
}

impl CaptureSession {
    pub fn new(request: CaptureRequest, config: AppConfig) -> Self {
        let output = request
            .output
            .unwrap_or_else(|| default_output_path(request.platform, &request.room_id));
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            platform: request.platform,
            profile: profile_for(request.platform),
            room_id: request.room_id,
            policy: SnapshotPolicy::every(config.capture.snapshot_every),
            config,
            launcher: Arc::new(ChromeLauncher),
            store: CommentStore::new(output),
            browser: None,
            taps: Taps::default(),
            log: SessionLog::detached(),
            state_tx,
            cleaned: false,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Hand the session its log file; it is closed during cleanup.
    pub fn with_log(mut self, log: SessionLog) -> Self {
        self.log = log;
        self
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn store(&self) -> &CommentStore {
        &self.store
    }

    pub fn output_path(&self) -> &Path {
        self.store.path()
    }

    /// Drive the session until `cancel` fires, the stream ends, or a fatal error.
    /// Cleanup always runs before this returns.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionOutcome, CaptureError> {
        info!(
            target: "danmaku-capture",
            platform = %self.platform,
            room_id = %self.room_id,
            output = %self.store.path().display(),
            "starting capture session"
        );
        let result = self.drive(&cancel).await;
        if let Err(err) = &result {
            error!(target: "danmaku-capture", %err, "capture session failed");
        }
        self.cleanup().await;
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<SessionOutcome, CaptureError> {
        self.set_state(SessionState::Navigating);

        let launched = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionOutcome::Cancelled),
            launched = self.launcher.launch(&self.config.browser) => launched,
        };
        let browser = launched.map_err(CaptureError::Launch)?;
        let page = browser.page().clone();
        let router = browser.router();
        let disconnected = browser.disconnected();
        self.browser = Some(browser);

        let navigator = Navigator::new(
            &page,
            &router,
            self.profile.as_ref(),
            &self.config.capture,
            &self.config.tap,
        );
        let Some(status) = navigator.open_room(&self.room_id, cancel).await? else {
            return Ok(SessionOutcome::Cancelled);
        };
        if status.ended && self.config.capture.ended_policy == EndedPolicy::Stop {
            info!(target: "danmaku-capture", url = %status.url, "stream has ended; stopping");
            return Ok(SessionOutcome::StreamEnded);
        }

        let (sink, mut payloads) = PayloadSink::channel(self.config.tap.channel_capacity);
        let session_id = page.session_id().to_string();
        self.taps.interceptor = Some(
            TrafficInterceptor::attach(
                page.clone(),
                &router,
                Classifier::new(&self.config.tap.keywords),
                sink.clone(),
                &self.config.tap,
            )
            .await?,
        );
        if self.profile.watches_console() {
            self.taps.console = Some(ConsoleWatcher::attach(
                &router,
                &session_id,
                &self.config.tap.console_keywords,
                sink.clone(),
            ));
        }
        self.taps.socket = Some(SocketListener::attach(&router, &session_id, sink));

        self.set_state(SessionState::Monitoring);
        info!(target: "danmaku-capture", "listening for danmaku");

        let mut ticker = interval(self.config.capture.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(target: "danmaku-capture", "interrupt received; stopping capture");
                    self.drain(&mut payloads);
                    return Ok(SessionOutcome::Cancelled);
                }
                _ = disconnected.cancelled() => {
                    self.drain_closed(&mut payloads).await;
                    return Err(CaptureError::BrowserDisconnected);
                }
                Some(message) = payloads.recv() => self.ingest(message),
                _ = ticker.tick() => self.periodic_snapshot(),
            }
        }
    }

    fn ingest(&mut self, message: RawMessage) {
        let drafts = self.profile.extract(message.origin(), message.payload());
        if drafts.is_empty() {
            debug!(
                target: "danmaku-capture",
                origin = message.origin().as_str(),
                url = message.url(),
                "payload carried no comments"
            );
        }
        for draft in drafts {
            info!(target: "danmaku-capture", "danmaku: {}: {}", draft.user, draft.content);
            self.store
                .append(Comment::stamp(draft, self.platform, &self.room_id));
        }
    }

    fn drain(&mut self, payloads: &mut mpsc::Receiver<RawMessage>) {
        while let Ok(message) = payloads.try_recv() {
            self.ingest(message);
        }
    }

    /// The browser is gone: the taps drop their senders once their subscriptions run dry,
    /// so read until the channel closes or the shutdown grace runs out.
    async fn drain_closed(&mut self, payloads: &mut mpsc::Receiver<RawMessage>) {
        let deadline = Instant::now() + Duration::from_millis(self.config.tap.shutdown_grace_ms);
        loop {
            match timeout_at(deadline, payloads.recv()).await {
                Ok(Some(message)) => self.ingest(message),
                Ok(None) => break,
                Err(_) => {
                    debug!(target: "danmaku-capture", "taps still open after grace period");
                    self.drain(payloads);
                    break;
                }
            }
        }
    }

    fn periodic_snapshot(&self) {
        if !self.policy.due(self.store.len()) {
            return;
        }
        match self.store.snapshot() {
            Ok(count) => info!(
                target: "danmaku-capture",
                "Saved {count} comments to {}",
                self.store.path().display()
            ),
            Err(err) => error!(target: "danmaku-capture", %err, "periodic snapshot failed"),
        }
    }

    /// Stop the taps, release the browser, write the final snapshot. Runs once.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            debug!(target: "danmaku-capture", "cleanup already ran");
            return;
        }
        self.cleaned = true;
        self.set_state(SessionState::ShuttingDown);

        self.taps.stop().await;
        if let Some(browser) = self.browser.take() {
            browser.release().await;
        }
        match self.store.snapshot() {
            Ok(count) => info!(
                target: "danmaku-capture",
                "Saved {count} comments to {}",
                self.store.path().display()
            ),
            Err(err) => error!(target: "danmaku-capture", %err, "final snapshot failed"),
        }
        info!(target: "danmaku-capture", "cleanup complete");
        self.log.close();
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, state: SessionState) {
        debug!(target: "danmaku-capture", ?state, "session state");
        self.state_tx.send_replace(state);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.cleaned {
            warn!(
                target: "danmaku-capture",
                "capture session dropped before cleanup; {} comments not persisted",
                self.store.len()
            );
        }
    }
}
