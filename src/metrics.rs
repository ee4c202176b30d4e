use std::sync::Once;

use cdp_adapter::metrics as cdp_metrics;
use lazy_static::lazy_static;
use network_tap::metrics as tap_metrics;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    static ref GLOBAL_REGISTRY: Registry = Registry::new();
}

static REGISTER_ONCE: Once = Once::new();

pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let registry = global_registry();
        cdp_metrics::register_metrics(registry);
        tap_metrics::register_metrics(registry);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

/// Prometheus text exposition of everything registered.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&global_registry().gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
