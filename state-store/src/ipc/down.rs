//! "Backend is down" markers.
//!
//! When a provider gives up on its backend it records a deadline outside
//! that backend, so every process skips it until the deadline passes
//! instead of retrying the network on each request.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared "unavailable until" fact about an IPC backend.
pub trait DownMarker: Send + Sync {
    /// Deadline (unix milliseconds) of the current down window, if any.
    ///
    /// Expired markers are cleared.
    fn down_until(&self) -> Option<i64>;

    /// Mark the backend down for `duration`.
    fn mark_down(&self, duration: Duration) -> bool;

    /// True while a down window is in effect.
    fn is_down(&self) -> bool {
        self.down_until().is_some()
    }
}

/// Down marker kept in a file holding the deadline.
///
/// Readable by every process on the host even when the backend itself is
/// unreachable. Each deadline is logged as a warning once per instance.
#[derive(Debug)]
pub struct FileDownMarker {
    path: PathBuf,
    reported: AtomicI64,
}

impl FileDownMarker {
    /// Marker stored at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reported: AtomicI64::new(0),
        }
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DownMarker for FileDownMarker {
    fn down_until(&self) -> Option<i64> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let deadline = content.trim().parse::<i64>().unwrap_or(0);

        if deadline > now_millis() {
            if self.reported.swap(deadline, Ordering::SeqCst) != deadline {
                tracing::warn!(path = %self.path.display(), down_until_ms = deadline, "IPC backend is marked as down");
            } else {
                tracing::debug!(down_until_ms = deadline, "IPC backend still marked as down");
            }
            return Some(deadline);
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Could not remove expired down marker");
            }
        }
        None
    }

    fn mark_down(&self, duration: Duration) -> bool {
        let deadline = now_millis() + duration.as_millis() as i64;
        tracing::warn!(secs = duration.as_secs(), "Marking IPC backend as down");

        match std::fs::write(&self.path, deadline.to_string()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Could not write down marker");
                false
            }
        }
    }
}

/// Down marker private to one process.
#[derive(Debug, Default)]
pub struct MemoryDownMarker {
    until: AtomicI64,
}

impl MemoryDownMarker {
    /// Marker that is not down.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownMarker for MemoryDownMarker {
    fn down_until(&self) -> Option<i64> {
        let deadline = self.until.load(Ordering::SeqCst);
        if deadline == 0 {
            return None;
        }
        if deadline > now_millis() {
            return Some(deadline);
        }
        let _ = self
            .until
            .compare_exchange(deadline, 0, Ordering::SeqCst, Ordering::SeqCst);
        None
    }

    fn mark_down(&self, duration: Duration) -> bool {
        let deadline = now_millis() + duration.as_millis() as i64;
        self.until.store(deadline, Ordering::SeqCst);
        true
    }
}
