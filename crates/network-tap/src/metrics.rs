use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

use crate::PayloadOrigin;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapMetricsSnapshot {
    pub requests_paused: u64,
    pub requests_matched: u64,
    pub payloads_forwarded: u64,
    pub payloads_dropped: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
}

static REQUESTS_PAUSED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_MATCHED: AtomicU64 = AtomicU64::new(0);
static PAYLOADS_FORWARDED: AtomicU64 = AtomicU64::new(0);
static PAYLOADS_DROPPED: AtomicU64 = AtomicU64::new(0);
static DECODE_FAILURES: AtomicU64 = AtomicU64::new(0);
static HANDLER_FAILURES: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref TAP_REQUESTS_PAUSED_TOTAL: IntCounter = IntCounter::new(
        "danmaku_tap_requests_paused_total",
        "Requests paused by the traffic interceptor",
    )
    .unwrap();
    static ref TAP_REQUESTS_MATCHED_TOTAL: IntCounter = IntCounter::new(
        "danmaku_tap_requests_matched_total",
        "Requests classified as chat-relevant",
    )
    .unwrap();
    static ref TAP_PAYLOADS_FORWARDED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "danmaku_tap_payloads_forwarded_total",
            "Decoded payloads handed to the capture loop"
        ),
        &["origin"]
    )
    .unwrap();
    static ref TAP_PAYLOADS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "danmaku_tap_payloads_dropped_total",
            "Decoded payloads dropped because the capture loop lagged"
        ),
        &["origin"]
    )
    .unwrap();
    static ref TAP_DECODE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "danmaku_tap_decode_failures_total",
            "Bodies or frames that were not JSON"
        ),
        &["origin"]
    )
    .unwrap();
    static ref TAP_HANDLER_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "danmaku_tap_handler_failures_total",
        "Interception handlers that failed and fell back to continuing the request",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register tap metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, TAP_REQUESTS_PAUSED_TOTAL.clone());
    register(registry, TAP_REQUESTS_MATCHED_TOTAL.clone());
    register(registry, TAP_PAYLOADS_FORWARDED_TOTAL.clone());
    register(registry, TAP_PAYLOADS_DROPPED_TOTAL.clone());
    register(registry, TAP_DECODE_FAILURES_TOTAL.clone());
    register(registry, TAP_HANDLER_FAILURES_TOTAL.clone());
}

pub fn record_paused() {
    REQUESTS_PAUSED.fetch_add(1, Ordering::Relaxed);
    TAP_REQUESTS_PAUSED_TOTAL.inc();
}

pub fn record_matched() {
    REQUESTS_MATCHED.fetch_add(1, Ordering::Relaxed);
    TAP_REQUESTS_MATCHED_TOTAL.inc();
}

pub fn record_forwarded(origin: PayloadOrigin) {
    PAYLOADS_FORWARDED.fetch_add(1, Ordering::Relaxed);
    TAP_PAYLOADS_FORWARDED_TOTAL
        .with_label_values(&[origin.as_str()])
        .inc();
}

pub fn record_dropped(origin: PayloadOrigin) {
    PAYLOADS_DROPPED.fetch_add(1, Ordering::Relaxed);
    TAP_PAYLOADS_DROPPED_TOTAL
        .with_label_values(&[origin.as_str()])
        .inc();
}

pub fn record_decode_failure(origin: PayloadOrigin) {
    DECODE_FAILURES.fetch_add(1, Ordering::Relaxed);
    TAP_DECODE_FAILURES_TOTAL
        .with_label_values(&[origin.as_str()])
        .inc();
}

pub fn record_handler_failure() {
    HANDLER_FAILURES.fetch_add(1, Ordering::Relaxed);
    TAP_HANDLER_FAILURES_TOTAL.inc();
}

pub fn snapshot() -> TapMetricsSnapshot {
    TapMetricsSnapshot {
        requests_paused: REQUESTS_PAUSED.load(Ordering::Relaxed),
        requests_matched: REQUESTS_MATCHED.load(Ordering::Relaxed),
        payloads_forwarded: PAYLOADS_FORWARDED.load(Ordering::Relaxed),
        payloads_dropped: PAYLOADS_DROPPED.load(Ordering::Relaxed),
        decode_failures: DECODE_FAILURES.load(Ordering::Relaxed),
        handler_failures: HANDLER_FAILURES.load(Ordering::Relaxed),
    }
}
