use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;
use crate::util::extract_ws_url;

const COMMAND_QUEUE: usize = 128;
const EVENT_QUEUE: usize = 512;
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5);

/// Launch flags that keep a throwaway profile quiet.
const QUIET_FLAGS: &[&str] = &[
    "--disable-background-timer-throttling",
    "--disable-breakpad",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-hang-monitor",
    "--disable-popup-blocking",
    "--disable-sync",
    "--no-first-run",
    "--no-default-browser-check",
    "--password-store=basic",
    "--remote-allow-origins=*",
    "--use-mock-keychain",
];

#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;

    /// Next browser event. `None` once the connection is gone for good.
    async fn next_event(&self) -> Option<TransportEvent>;

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;

    /// Tear the connection down. Later commands fail instead of relaunching anything.
    async fn shutdown(&self) {}
}

type Reply = oneshot::Sender<Result<Value, AdapterError>>;

struct Outgoing {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: Reply,
}

/// A live connection to one browser. `lost` fires when the pump exits or the heartbeat fails.
struct Link {
    commands: mpsc::Sender<Outgoing>,
    lost: CancellationToken,
    pump: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl Link {
    async fn close(mut self) {
        self.lost.cancel();
        self.pump.abort();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                debug!(target: "cdp-transport", ?err, "chromium child already gone");
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.lost.cancel();
        self.pump.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
                    }
                });
            }
            Err(_) => debug!(target: "cdp-transport", "no runtime left to kill chromium child"),
        }
    }
}

/// Chromium over a raw DevTools websocket. One browser per transport; a dead browser is
/// reported through `next_event() == None` and failing commands, never relaunched.
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Mutex<Option<Link>>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        Self {
            cfg,
            link: Mutex::new(None),
            events: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }

    async fn sender(&self) -> Result<mpsc::Sender<Outgoing>, AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint("transport closed"));
        }
        match self.link.lock().await.as_ref() {
            Some(link) if !link.lost.is_cancelled() => Ok(link.commands.clone()),
            Some(_) => Err(connection_lost()),
            None => {
                Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint("transport not started"))
            }
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::new(AdapterErrorKind::Launch).with_hint("transport closed"));
        }
        let mut slot = self.link.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let (child, ws_url) = match &self.cfg.websocket_url {
            Some(url) => (None, url.clone()),
            None => {
                let (child, url) = launch(&self.cfg).await?;
                (Some(child), url)
            }
        };
        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::Launch).with_hint(err.to_string()))?;

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let lost = CancellationToken::new();
        let pump = tokio::spawn(pump(conn, command_rx, events_tx, lost.clone()));

        let heartbeat = (self.cfg.heartbeat_interval_ms > 0).then(|| {
            let ping_tx = commands.clone();
            tokio::spawn(watch_liveness(
                move || {
                    let tx = ping_tx.clone();
                    async move {
                        request(
                            &tx,
                            CommandTarget::Browser,
                            "Browser.getVersion",
                            json!({}),
                            HEARTBEAT_DEADLINE,
                        )
                        .await
                    }
                },
                Duration::from_millis(self.cfg.heartbeat_interval_ms),
                HEARTBEAT_DEADLINE,
                lost.clone(),
            ))
        });

        info!(target: "cdp-transport", url = %ws_url, "chromium connection established");
        *self.events.lock().await = Some(events_rx);
        *slot = Some(Link {
            commands,
            lost,
            pump,
            heartbeat,
            child,
        });
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut events = self.events.lock().await;
        events.as_mut()?.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let commands = self.sender().await?;
        let started = Instant::now();
        let result = request(&commands, target, method, params, self.deadline()).await;
        metrics::record_command(method, started.elapsed(), result.is_ok());
        result
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
            info!(target: "cdp-transport", "chromium transport shut down");
        }
    }
}

fn connection_lost() -> AdapterError {
    AdapterError::new(AdapterErrorKind::CdpIo).with_hint("browser connection lost")
}

async fn request(
    commands: &mpsc::Sender<Outgoing>,
    target: CommandTarget,
    method: &str,
    params: Value,
    deadline: Duration,
) -> Result<Value, AdapterError> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Outgoing {
            target,
            method: method.to_string(),
            params,
            reply,
        })
        .await
        .map_err(|_| connection_lost())?;

    match timeout(deadline, response).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(connection_lost()),
        Err(_) => Err(AdapterError::new(AdapterErrorKind::NavTimeout)
            .with_hint(format!("{method} timed out"))),
    }
}

/// Ping the browser every `every`; the first failed or late ping cancels `lost`.
async fn watch_liveness<F, Fut>(
    mut ping: F,
    every: Duration,
    deadline: Duration,
    lost: CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, AdapterError>>,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = lost.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let failure = match timeout(deadline, ping()).await {
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("no answer within {deadline:?}"),
        };
        if lost.is_cancelled() {
            return;
        }
        metrics::record_heartbeat_failure();
        warn!(target: "cdp-transport", %failure, "browser heartbeat failed; connection lost");
        lost.cancel();
        return;
    }
}

async fn pump(
    mut conn: Connection<CdpEventMessage>,
    mut commands: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<TransportEvent>,
    lost: CancellationToken,
) {
    let mut pending: HashMap<CallId, Reply> = HashMap::new();

    let reason = loop {
        tokio::select! {
            _ = lost.cancelled() => break connection_lost(),
            Some(out) = commands.recv() => {
                let session = match out.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
                };
                let method: MethodId = out.method.into();
                match conn.submit_command(method, session, out.params) {
                    Ok(call) => {
                        pending.insert(call, out.reply);
                    }
                    Err(err) => {
                        let _ = out.reply.send(Err(
                            AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()),
                        ));
                    }
                }
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(reply) = pending.remove(&resp.id) {
                        let _ = reply.send(response_payload(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => forward(event, &events).await,
                Some(Err(err)) => break map_cdp_error(err),
                None => {
                    break AdapterError::new(AdapterErrorKind::CdpIo)
                        .with_hint("cdp connection closed")
                }
            },
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(reason.clone()));
    }
    lost.cancel();
    warn!(target: "cdp-transport", err = %reason, "chromium connection ended");
}

async fn forward(event: CdpEventMessage, events: &mpsc::Sender<TransportEvent>) {
    let raw: CdpJsonEventMessage = match event.try_into() {
        Ok(raw) => raw,
        Err(err) => {
            debug!(target: "cdp-transport", %err, "undecodable cdp event");
            return;
        }
    };
    metrics::record_event();
    let event = TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    };
    if events.send(event).await.is_err() {
        debug!(target: "cdp-transport", "event receiver gone");
    }
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .retriable(error.code >= 500)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn map_cdp_error(err: CdpError) -> AdapterError {
    let kind = match err {
        CdpError::Timeout => AdapterErrorKind::NavTimeout,
        _ => AdapterErrorKind::CdpIo,
    };
    AdapterError::new(kind).with_hint(err.to_string())
}

async fn launch(cfg: &CdpConfig) -> Result<(Child, String), AdapterError> {
    let launch_error = |hint: String| AdapterError::new(AdapterErrorKind::Launch).with_hint(hint);

    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(launch_error(format!(
            "chrome executable not found at {}",
            cfg.executable.display()
        ))
        .with_data(json!({
            "expected": cfg.executable,
            "hint": "Set DANMAKU_CHROME to the full path of chrome/chromium."
        })));
    }

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| launch_error(format!("failed to resolve cwd: {err}")))?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir)
        .map_err(|err| launch_error(format!("failed to create user-data-dir: {err}")))?;

    let mut args: Vec<String> = QUIET_FLAGS.iter().map(|flag| flag.to_string()).collect();
    if cfg.headless {
        args.extend(["--headless=new", "--hide-scrollbars", "--mute-audio"].map(String::from));
    }
    for extra in &cfg.launch_args {
        if !args.contains(extra) {
            args.push(extra.clone());
        }
    }

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_secs(20))
        .args(args)
        .user_data_dir(profile_dir);
    if !cfg.headless {
        builder = builder.with_head();
    }
    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }
    let config = builder
        .build()
        .map_err(|err| launch_error(format!("browser config error: {err}")))?;

    let mut child = config
        .launch()
        .map_err(|err| launch_error(format!("failed to launch chromium: {err}")))?;
    let ws_url = extract_ws_url(&mut child)
        .await
        .map_err(|err| launch_error(err.to_string()))?;
    Ok((child, ws_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn unanswered_heartbeat_marks_connection_lost() {
        let lost = CancellationToken::new();
        let before = metrics::snapshot().heartbeat_failures;
        let watcher = tokio::spawn(watch_liveness(
            || futures::future::pending::<Result<Value, AdapterError>>(),
            Duration::from_millis(10),
            Duration::from_millis(20),
            lost.clone(),
        ));

        timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("hung browser detected");
        watcher.await.unwrap();
        assert!(metrics::snapshot().heartbeat_failures > before);
    }

    #[tokio::test]
    async fn failing_heartbeat_marks_connection_lost() {
        let lost = CancellationToken::new();
        let watcher = tokio::spawn(watch_liveness(
            || async { Err(connection_lost()) },
            Duration::from_millis(10),
            Duration::from_millis(50),
            lost.clone(),
        ));

        timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
        assert!(lost.is_cancelled());
    }

    #[tokio::test]
    async fn healthy_heartbeat_keeps_pinging_until_closed() {
        let lost = CancellationToken::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        let watcher = tokio::spawn(watch_liveness(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({ "product": "Chrome/120" })) }
            },
            Duration::from_millis(5),
            Duration::from_millis(50),
            lost.clone(),
        ));

        timeout(Duration::from_secs(2), async {
            while pings.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!lost.is_cancelled());

        lost.cancel();
        timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dead_queue_reports_lost_connection() {
        let (commands, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let err = request(
            &commands,
            CommandTarget::Browser,
            "Browser.getVersion",
            json!({}),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
    }

    #[tokio::test]
    async fn refuses_commands_before_start_and_after_shutdown() {
        let transport = ChromiumTransport::new(CdpConfig::default());
        let err = transport
            .send_command(CommandTarget::Browser, "Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);

        transport.shutdown().await;
        transport.shutdown().await;

        assert!(transport.start().await.is_err());
        assert!(transport.next_event().await.is_none());
        let err = transport
            .send_command(CommandTarget::Browser, "Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
    }
}
