//! Configuration for a capture run.
//!
//! Loaded from YAML; every section and field falls back to its default so a partial file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cdp_adapter::CdpConfig;
use network_tap::TapConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::errors::CaptureError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub browser: CdpConfig,
    pub capture: CaptureSettings,
    pub tap: TapConfig,
}

/// What to do once the page shows an "ended" marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndedPolicy {
    /// Log a warning and keep capturing.
    #[default]
    Continue,
    /// Stop gracefully after the final snapshot.
    Stop,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub tick_interval_ms: u64,
    pub render_grace_ms: u64,
    pub navigation_timeout_ms: u64,
    pub idle_window_ms: u64,
    pub snapshot_every: usize,
    pub ended_policy: EndedPolicy,
    pub log_dir: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            render_grace_ms: 5000,
            navigation_timeout_ms: 30_000,
            idle_window_ms: 500,
            snapshot_every: 10,
            ended_policy: EndedPolicy::Continue,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl CaptureSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn render_grace(&self) -> Duration {
        Duration::from_millis(self.render_grace_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }
}

pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
}

/// Resolve the config path: explicit path, then `./config/capture.yaml`,
/// then `{config_dir}/danmaku-capture/config.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("config/capture.yaml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir().map(|mut path| {
        path.push("danmaku-capture");
        path.push("config.yaml");
        path
    })
}

pub async fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, CaptureError> {
    let path = resolve_config_path(explicit).unwrap_or_else(|| PathBuf::from("config/capture.yaml"));

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path).await?;
        let config: AppConfig = serde_yaml::from_str(&content).map_err(|err| {
            CaptureError::Config(format!("failed to parse {}: {err}", path.display()))
        })?;
        info!(target: "danmaku-capture", "Loaded configuration from: {}", path.display());
        config
    } else {
        warn!(
            target: "danmaku-capture",
            "Config file not found, using defaults: {}",
            path.display()
        );
        AppConfig::default()
    };

    config.browser.apply_env_overrides();
    validate(&config)?;
    Ok(LoadedConfig { config, path })
}

fn validate(config: &AppConfig) -> Result<(), CaptureError> {
    if config.capture.snapshot_every == 0 {
        return Err(CaptureError::Config(
            "capture.snapshot_every must be at least 1".into(),
        ));
    }
    if config.tap.keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(CaptureError::Config("tap.keywords must not be empty".into()));
    }
    Ok(())
}
