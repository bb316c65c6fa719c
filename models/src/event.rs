use std::path::PathBuf;

use time::OffsetDateTime;

/// A file the watcher has accepted for upload.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    /// The file became visible through an atomic move into the watched
    /// directory, so it was dispatched without probing.
    pub is_rename: bool,
    /// Stability was assumed because the probe budget expired; the source
    /// must be preserved after upload.
    pub processed_due_to_timeout: bool,
    pub timestamp: OffsetDateTime,
}

impl FileEvent {
    pub fn new(path: PathBuf, is_rename: bool, processed_due_to_timeout: bool) -> Self {
        Self {
            path,
            is_rename,
            processed_due_to_timeout,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn into_job(self) -> UploadJob {
        UploadJob {
            path: self.path,
            processed_due_to_timeout: self.processed_due_to_timeout,
        }
    }
}

/// One entry in an upload pool's bounded queue.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub path: PathBuf,
    pub processed_due_to_timeout: bool,
}
