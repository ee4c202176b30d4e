//! Adapter counters. Collectors are process-wide; the binary decides which registry exports them.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{core::Collector, histogram_opts, HistogramVec, IntCounter, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub events: u64,
    pub dropped_events: u64,
    pub failed_commands: u64,
    pub heartbeat_failures: u64,
}

lazy_static! {
    static ref COMMAND_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "danmaku_cdp_command_seconds",
            "Round trip of a CDP command, by method and outcome",
            vec![0.01, 0.05, 0.25, 1.0, 5.0]
        ),
        &["method", "outcome"]
    )
    .unwrap();
    static ref FAILED_COMMANDS: IntCounter = IntCounter::new(
        "danmaku_cdp_command_failures_total",
        "CDP commands that returned an error or timed out"
    )
    .unwrap();
    static ref EVENTS: IntCounter =
        IntCounter::new("danmaku_cdp_events_total", "CDP events read off the connection").unwrap();
    static ref DROPPED_EVENTS: IntCounter = IntCounter::new(
        "danmaku_cdp_events_dropped_total",
        "Events discarded because a subscriber queue was full"
    )
    .unwrap();
    static ref HEARTBEAT_FAILURES: IntCounter = IntCounter::new(
        "danmaku_cdp_heartbeat_failures_total",
        "Heartbeats that failed and marked the browser lost"
    )
    .unwrap();
}

pub fn register_metrics(registry: &Registry) {
    let collectors: [Box<dyn Collector>; 5] = [
        Box::new(COMMAND_SECONDS.clone()),
        Box::new(FAILED_COMMANDS.clone()),
        Box::new(EVENTS.clone()),
        Box::new(DROPPED_EVENTS.clone()),
        Box::new(HEARTBEAT_FAILURES.clone()),
    ];
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => error!(?err, "failed to register cdp adapter metric"),
        }
    }
}

pub fn record_command(method: &str, elapsed: Duration, ok: bool) {
    let outcome = if ok {
        "ok"
    } else {
        FAILED_COMMANDS.inc();
        "error"
    };
    COMMAND_SECONDS
        .with_label_values(&[method, outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_event() {
    EVENTS.inc();
}

pub fn record_dropped_event() {
    DROPPED_EVENTS.inc();
}

pub fn record_heartbeat_failure() {
    HEARTBEAT_FAILURES.inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        events: EVENTS.get(),
        dropped_events: DROPPED_EVENTS.get(),
        failed_commands: FAILED_COMMANDS.get(),
        heartbeat_failures: HEARTBEAT_FAILURES.get(),
    }
}
