use std::future::Future;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::env::CliArgs;
use crate::config::{load_config, LoadedConfig};
use crate::logging::{SessionLog, SessionLogSlot};
use crate::metrics;
use crate::platform::checked_room_id;
use crate::session::{CaptureRequest, CaptureSession};

/// Install the global subscriber. The returned slot feeds the per-session file layer.
pub fn init_logging(level: &str, debug: bool) -> Result<SessionLogSlot> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    let slot = SessionLogSlot::default();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(slot.clone()),
        )
        .init();

    Ok(slot)
}

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();
    let slot = init_logging(&cli.log_level, cli.debug)?;
    metrics::register_metrics();

    info!(
        "Starting danmaku-capture v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    );

    let room_id = checked_room_id(&cli.room_id)?.to_string();
    let LoadedConfig { mut config, path } = load_config(cli.config.as_deref()).await?;
    debug!(config = %path.display(), "configuration resolved");
    if cli.headless {
        config.browser.headless = true;
    }

    let log = match SessionLog::open(&slot, &config.capture.log_dir, cli.platform, &room_id) {
        Ok(log) => log,
        Err(err) => {
            warn!(%err, dir = %config.capture.log_dir.display(), "session log unavailable");
            SessionLog::detached()
        }
    };

    let request = CaptureRequest {
        platform: cli.platform,
        room_id,
        output: cli.output.clone(),
    };
    let mut session = CaptureSession::new(request, config).with_log(log);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(handle_interrupts(tokio::signal::ctrl_c, interrupt, || {
        std::process::exit(130);
    }));

    let result = session.run(cancel).await;
    debug!(metrics = %metrics::render(), "final metrics");
    match result {
        Ok(outcome) => {
            info!(
                ?outcome,
                comments = session.store().len(),
                output = %session.output_path().display(),
                "capture finished"
            );
            Ok(())
        }
        Err(err) => {
            error!("Capture failed: {}", err);
            Err(err.into())
        }
    }
}

/// The first interrupt stops the session gracefully. A second one, while cleanup is still
/// running, calls `force_exit`.
async fn handle_interrupts<S, Fut, X>(mut next_signal: S, cancel: CancellationToken, force_exit: X)
where
    S: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
    X: FnOnce(),
{
    if let Err(err) = next_signal().await {
        error!(%err, "failed to listen for ctrl-c");
        return;
    }
    info!("interrupt received; press ctrl-c again to exit without cleanup");
    cancel.cancel();

    match next_signal().await {
        Ok(()) => {
            warn!("second interrupt; exiting immediately");
            force_exit();
        }
        Err(err) => error!(%err, "failed to listen for ctrl-c"),
    }
}
