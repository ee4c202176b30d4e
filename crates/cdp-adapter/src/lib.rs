//! Chromium DevTools Protocol adapter for the danmaku capture engine.
//!
//! The crate owns everything that talks to the browser process: launch configuration, the raw
//! CDP transport, a fan-out router that hands events to cancellable subscriptions, and the
//! single-page [`BrowserSession`] a capture session drives.

use std::{env, path::PathBuf};
use which::which;

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("browser launch failed")]
        Launch,
        #[error("navigation timed out")]
        NavTimeout,
        #[error("navigation failed")]
        Navigation,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        /// Re-tag an error, keeping its hint and payload.
        pub fn into_kind(mut self, kind: AdapterErrorKind) -> Self {
            self.kind = kind;
            self
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{
        env,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    /// Flags that keep `navigator.webdriver` style automation hints out of the page.
    pub const STEALTH_ARGS: &[&str] = &[
        "--disable-blink-features=AutomationControlled",
        "--disable-web-security",
        "--disable-features=VizDisplayCompositor",
        "--no-sandbox",
        "--disable-dev-shm-usage",
    ];

    /// Configuration for launching and tuning the browser.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub default_deadline_ms: u64,
        pub websocket_url: Option<String>,
        /// Browser liveness ping period; a failed ping counts as a disconnect. `0` disables it.
        pub heartbeat_interval_ms: u64,
        pub launch_args: Vec<String>,
        pub user_agent: String,
        pub accept_language: Option<String>,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                default_deadline_ms: 30_000,
                websocket_url: None,
                heartbeat_interval_ms: 15_000,
                launch_args: STEALTH_ARGS.iter().map(|arg| arg.to_string()).collect(),
                user_agent: DEFAULT_USER_AGENT.to_string(),
                accept_language: None,
            }
        }
    }

    impl CdpConfig {
        /// Re-apply environment overrides on top of a deserialized config.
        pub fn apply_env_overrides(&mut self) {
            if let Ok(value) = env::var("DANMAKU_HEADLESS") {
                self.headless = parse_flag(&value);
            }
            if let Some(path) = detect_chrome_from_env() {
                self.executable = path;
            }
            if let Ok(path) = env::var("DANMAKU_CHROME_PROFILE") {
                if !path.trim().is_empty() {
                    self.user_data_dir = PathBuf::from(path.trim());
                }
            }
        }
    }

    fn parse_flag(value: &str) -> bool {
        !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off"
        )
    }

    // Headful unless DANMAKU_HEADLESS says otherwise; livestream pages behave better with a window.
    fn resolve_headless_default() -> bool {
        env::var("DANMAKU_HEADLESS")
            .map(|value| parse_flag(&value))
            .unwrap_or(false)
    }

    fn detect_chrome_from_env() -> Option<PathBuf> {
        let raw = env::var("DANMAKU_CHROME").ok()?;
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("DANMAKU_CHROME_PROFILE") {
            return PathBuf::from(path);
        }

        let default = Path::new("./.danmaku-profile");
        default.into()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn flag_parsing_accepts_common_spellings() {
            assert!(parse_flag("1"));
            assert!(parse_flag("TRUE"));
            assert!(parse_flag("yes"));
            assert!(!parse_flag("off"));
            assert!(!parse_flag(" 0 "));
        }

        #[test]
        fn default_args_carry_stealth_flags() {
            let cfg = CdpConfig::default();
            assert!(cfg
                .launch_args
                .iter()
                .any(|arg| arg == "--disable-blink-features=AutomationControlled"));
            assert_eq!(cfg.user_agent, DEFAULT_USER_AGENT);
        }

        #[test]
        fn partial_yaml_keeps_defaults() {
            let cfg: CdpConfig = serde_yaml::from_str("headless: true\n").unwrap();
            assert!(cfg.headless);
            assert_eq!(cfg.default_deadline_ms, 30_000);
            assert_eq!(cfg.launch_args.len(), STEALTH_ARGS.len());
        }
    }
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("DANMAKU_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("DANMAKU_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let root = PathBuf::from(value.trim());
                paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                paths.push(root.join("Chromium/Application/chrome.exe"));
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}


pub mod metrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod router;
pub mod session;
pub mod transport;
pub mod util;

pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use metrics::AdapterMetricsSnapshot;
pub use router::{EventFilter, EventRouter, Subscription};
pub use session::{BrowserSession, PageHandle};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};
