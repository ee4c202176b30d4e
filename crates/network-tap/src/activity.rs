//! Network activity bookkeeping used to decide when a freshly loaded page went quiet.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cdp_adapter::{EventFilter, EventRouter, Subscription, TransportEvent};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cumulative counters for the page since the monitor attached.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    pub requests: u64,
    pub res2xx: u64,
    pub res4xx: u64,
    pub res5xx: u64,
    pub inflight: u64,
    pub since_last_activity_ms: u64,
}

#[derive(Debug)]
struct Counters {
    requests: u64,
    res2xx: u64,
    res4xx: u64,
    res5xx: u64,
    inflight: HashSet<String>,
    last_activity: Instant,
}

impl Counters {
    fn new(now: Instant) -> Self {
        Self {
            requests: 0,
            res2xx: 0,
            res4xx: 0,
            res5xx: 0,
            inflight: HashSet::new(),
            last_activity: now,
        }
    }

    fn register(&mut self, event: &TransportEvent, now: Instant) {
        let request_id = event.params.get("requestId").and_then(Value::as_str);
        match (event.method.as_str(), request_id) {
            ("Network.requestWillBeSent", Some(id)) => {
                // Redirects reuse the request id; count the hop but keep one in-flight entry.
                self.requests += 1;
                self.inflight.insert(id.to_string());
            }
            ("Network.responseReceived", _) => {
                let status = event
                    .params
                    .get("response")
                    .and_then(|response| response.get("status"))
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                match status {
                    200..=299 => self.res2xx += 1,
                    400..=499 => self.res4xx += 1,
                    500..=599 => self.res5xx += 1,
                    _ => {}
                }
            }
            ("Network.loadingFinished" | "Network.loadingFailed", Some(id)) => {
                self.inflight.remove(id);
            }
            _ => return,
        }
        self.last_activity = now;
    }

    fn quiet(&self, now: Instant, window: Duration) -> bool {
        self.inflight.is_empty() && now.saturating_duration_since(self.last_activity) >= window
    }

    fn snapshot(&self, now: Instant) -> ActivitySnapshot {
        ActivitySnapshot {
            requests: self.requests,
            res2xx: self.res2xx,
            res4xx: self.res4xx,
            res5xx: self.res5xx,
            inflight: self.inflight.len() as u64,
            since_last_activity_ms: now
                .saturating_duration_since(self.last_activity)
                .as_millis() as u64,
        }
    }
}

pub struct ActivityMonitor {
    counters: Arc<Mutex<Counters>>,
    poll: Duration,
    cancel: CancellationToken,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ActivityMonitor {
    pub fn attach(router: &EventRouter, session_id: &str, poll: Duration) -> Self {
        let subscription = router.subscribe(
            EventFilter::methods([
                "Network.requestWillBeSent",
                "Network.responseReceived",
                "Network.loadingFinished",
                "Network.loadingFailed",
            ])
            .for_session(session_id),
        );

        let counters = Arc::new(Mutex::new(Counters::new(Instant::now())));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Self::pump(
            subscription,
            Arc::clone(&counters),
            cancel.clone(),
        ));

        Self {
            counters,
            poll: poll.max(Duration::from_millis(1)),
            cancel,
            pump: AsyncMutex::new(Some(pump)),
            stopped: AtomicBool::new(false),
        }
    }

    async fn pump(
        mut subscription: Subscription,
        counters: Arc<Mutex<Counters>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => counters.lock().register(&event, Instant::now()),
                    None => break,
                },
            }
        }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        self.counters.lock().snapshot(Instant::now())
    }

    pub fn is_idle(&self, window: Duration) -> bool {
        self.counters.lock().quiet(Instant::now(), window)
    }

    /// Wait until nothing has been in flight for `window`. Returns `false` if `deadline` passed first.
    pub async fn wait_for_idle(&self, window: Duration, deadline: Duration) -> bool {
        let started = Instant::now();
        let mut ticker = interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.is_idle(window) {
                return true;
            }
            if started.elapsed() >= deadline {
                debug!(target: "network-tap", snapshot = ?self.snapshot(), "network never went idle");
                return false;
            }
        }
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
