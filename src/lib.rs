//! Live-stream danmaku capture.
//!
//! A [`session::CaptureSession`] drives one Chromium page into a live room, taps its chat
//! traffic through `network-tap`, maps payloads with the room's [`platform::PlatformProfile`]
//! and snapshots the growing comment list to a JSON file.

pub mod cli;
pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod navigator;
pub mod platform;
pub mod session;
pub mod store;

pub use config::{load_config, AppConfig, CaptureSettings, EndedPolicy, LoadedConfig};
pub use errors::CaptureError;
pub use model::{Comment, CommentDraft, CommentKind, Platform};
pub use navigator::{Navigator, RoomStatus};
pub use platform::{profile_for, PlatformProfile};
pub use session::{
    BrowserLauncher, CaptureRequest, CaptureSession, ChromeLauncher, SessionOutcome, SessionState,
};
pub use store::{CommentStore, SnapshotPolicy};
