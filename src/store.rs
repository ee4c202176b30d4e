use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tempfile::NamedTempFile;

use crate::errors::CaptureError;
use crate::model::{Comment, Platform};

/// Default output file: `{platform}_{room_id}_{YYYYmmdd_HHMMSS}.json` in the working directory.
pub fn default_output_path(platform: Platform, room_id: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}_{}.json",
        platform,
        room_id,
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Append-only comment list with whole-file snapshots.
#[derive(Debug)]
pub struct CommentStore {
    path: PathBuf,
    records: Vec<Comment>,
}

impl CommentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, comment: Comment) {
        self.records.push(comment);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Comment] {
        &self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the output file with every record held so far. Returns the record count written.
    pub fn snapshot(&self) -> Result<usize, CaptureError> {
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let body = serde_json::to_vec_pretty(&self.records)?;
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| CaptureError::Io(err.error))?;
        Ok(self.records.len())
    }
}

/// Periodic-save rule: a tick saves when the count is a positive multiple of `every`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotPolicy {
    every: usize,
}

impl SnapshotPolicy {
    pub fn every(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn due(&self, len: usize) -> bool {
        len > 0 && len % self.every == 0
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(10)
    }
}
