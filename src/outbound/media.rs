//! Transient attachment files that delete themselves.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// A downloaded attachment owned by one dispatch task.
///
/// The file is removed when the guard drops, whether the post succeeded,
/// failed, or the task was cancelled.
#[derive(Debug)]
pub struct TempMedia {
    path: PathBuf,
}

impl TempMedia {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempMedia {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Transient media removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove transient media: {e}"),
        }
    }
}
