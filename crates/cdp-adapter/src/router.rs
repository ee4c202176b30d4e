//! Fan-out of transport events to explicit, cancellable subscriptions.
//!
//! A single pump task drains [`CdpTransport::next_event`] and hands each event to every
//! subscription whose [`EventFilter`] matches. Dropping (or cancelling) a [`Subscription`]
//! revokes it; there is no global callback table.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;
use crate::transport::{CdpTransport, TransportEvent};

/// Event selection: method names (`Domain.event` or `Domain.*`) and an optional CDP session.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    methods: Vec<String>,
    session: Option<String>,
    lossless: bool,
}

impl EventFilter {
    pub fn methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
            session: None,
            lossless: false,
        }
    }

    pub fn for_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// A full queue makes the pump wait instead of dropping the event. For events the
    /// browser blocks on, such as `Fetch.requestPaused`.
    pub fn lossless(mut self) -> Self {
        self.lossless = true;
        self
    }

    pub fn matches(&self, event: &TransportEvent) -> bool {
        if let Some(session) = &self.session {
            if event.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        self.methods.iter().any(|pattern| {
            match pattern.strip_suffix(".*") {
                Some(domain) => event
                    .method
                    .split_once('.')
                    .map(|(event_domain, _)| event_domain == domain)
                    .unwrap_or(false),
                None => pattern == &event.method,
            }
        })
    }
}

struct Route {
    filter: EventFilter,
    tx: mpsc::Sender<TransportEvent>,
}

type RouteTable = DashMap<Uuid, Route>;

pub struct EventRouter {
    routes: Arc<RouteTable>,
    buffer: usize,
    shutdown: CancellationToken,
    closed: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventRouter {
    pub fn spawn(transport: Arc<dyn CdpTransport>, buffer: usize) -> Self {
        let routes: Arc<RouteTable> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let pump = tokio::spawn(Self::pump(
            transport,
            Arc::clone(&routes),
            shutdown.clone(),
            closed.clone(),
        ));

        Self {
            routes,
            buffer: buffer.max(1),
            shutdown,
            closed,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.closed.is_cancelled() {
            // Sender dropped right away: the subscriber observes end-of-stream.
            drop(tx);
        } else {
            self.routes.insert(id, Route { filter, tx });
        }
        Subscription {
            id,
            rx,
            routes: Arc::downgrade(&self.routes),
        }
    }

    /// Fires once the underlying event stream has ended or the router was shut down.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.routes.len()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.pump.lock().await.take() {
            let _ = handle.await;
        }
        self.routes.clear();
    }

    async fn pump(
        transport: Arc<dyn CdpTransport>,
        routes: Arc<RouteTable>,
        shutdown: CancellationToken,
        closed: CancellationToken,
    ) {
        debug!(target: "cdp-adapter", "event pump entered");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = transport.next_event() => match event {
                    Some(event) => Self::dispatch(&routes, event, &shutdown).await,
                    None => {
                        if !shutdown.is_cancelled() {
                            warn!(target: "cdp-adapter", "cdp event stream ended");
                        }
                        break;
                    }
                },
            }
        }
        routes.clear();
        closed.cancel();
        debug!(target: "cdp-adapter", "event pump exiting");
    }

    async fn dispatch(routes: &RouteTable, event: TransportEvent, shutdown: &CancellationToken) {
        let mut stale = Vec::new();
        let mut backlogged = Vec::new();
        for entry in routes.iter() {
            let route = entry.value();
            if !route.filter.matches(&event) {
                continue;
            }
            match route.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) if route.filter.lossless => {
                    backlogged.push((*entry.key(), route.tx.clone(), event));
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::record_dropped_event();
                    warn!(
                        target: "cdp-adapter",
                        method = %event.method,
                        "subscriber backlog full; event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(*entry.key()),
            }
        }
        // The table guard is released before waiting on a slow subscriber.
        for (id, tx, event) in backlogged {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        stale.push(id);
                    }
                }
            }
        }
        for id in stale {
            routes.remove(&id);
        }
    }
}

/// Receiving end of a router registration. Revoked on drop.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<TransportEvent>,
    routes: Weak<RouteTable>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(routes) = self.routes.upgrade() {
            routes.remove(&self.id);
        }
    }
}
