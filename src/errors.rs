//! Error taxonomy of the capture engine.

use cdp_adapter::{AdapterError, AdapterErrorKind};
use network_tap::TapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("browser launch failed: {0}")]
    Launch(AdapterError),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("cdp command failed: {0}")]
    Cdp(AdapterError),
    #[error("tap failure: {0}")]
    Tap(#[from] TapError),
    #[error("browser connection lost")]
    BrowserDisconnected,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl CaptureError {
    /// Whether the error ends the capture session (as opposed to being logged and skipped).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::Launch(_)
                | CaptureError::Navigation(_)
                | CaptureError::Cdp(_)
                | CaptureError::Tap(_)
                | CaptureError::BrowserDisconnected
                | CaptureError::Config(_)
        )
    }
}

impl From<AdapterError> for CaptureError {
    fn from(err: AdapterError) -> Self {
        match err.kind {
            AdapterErrorKind::Launch => CaptureError::Launch(err),
            AdapterErrorKind::Navigation | AdapterErrorKind::NavTimeout => {
                CaptureError::Navigation(err.to_string())
            }
            AdapterErrorKind::CdpIo | AdapterErrorKind::Internal => CaptureError::Cdp(err),
        }
    }
}
