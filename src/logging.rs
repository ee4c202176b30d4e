//! Process logging plus the per-session rolling file.
//!
//! The global subscriber carries a file layer whose writer is a [`SessionLogSlot`]. A capture
//! session fills the slot with its own rolling appender through [`SessionLog::open`] and empties
//! it again at cleanup, so no logger outlives the session that owns it.

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;

use crate::errors::CaptureError;
use crate::model::Platform;

/// Rotated session log files kept on disk.
pub const RETAINED_LOG_FILES: usize = 7;

#[derive(Clone, Default)]
pub struct SessionLogSlot {
    writer: Arc<RwLock<Option<NonBlocking>>>,
}

impl SessionLogSlot {
    pub fn is_open(&self) -> bool {
        self.writer.read().is_some()
    }
}

pub struct SessionLogWriter(Option<NonBlocking>);

impl io::Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SessionLogSlot {
    type Writer = SessionLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter(self.writer.read().clone())
    }
}

/// Daily-rotated `{platform}_{room_id}.{date}.log` owned by one capture session.
pub struct SessionLog {
    slot: Option<SessionLogSlot>,
    guard: Option<WorkerGuard>,
}

impl SessionLog {
    pub fn open(
        slot: &SessionLogSlot,
        dir: &Path,
        platform: Platform,
        room_id: &str,
    ) -> Result<Self, CaptureError> {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(format!("{platform}_{room_id}"))
            .filename_suffix("log")
            .max_log_files(RETAINED_LOG_FILES)
            .build(dir)
            .map_err(|err| CaptureError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        *slot.writer.write() = Some(writer);
        Ok(Self {
            slot: Some(slot.clone()),
            guard: Some(guard),
        })
    }

    /// A session log that writes nowhere.
    pub fn detached() -> Self {
        Self {
            slot: None,
            guard: None,
        }
    }

    /// Detach from the subscriber and flush pending lines. Idempotent.
    pub fn close(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.writer.write().take();
        }
        self.guard.take();
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        self.close();
    }
}
