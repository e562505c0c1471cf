//! Per-file mutual exclusion between cooperating instances, local or not.
//!
//! The lock is a sibling file created with create-exclusive semantics; its
//! mtime is the liveness signal. An instance that dies mid-encode leaves a
//! lock behind, so locks older than the per-file encode deadline are
//! considered stale and may be broken by whoever finds them.

use crate::paths;
use crate::vfs::Vfs;
use chrono::{Local, SecondsFormat};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

/// Error acquiring a per-file lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live instance holds the lock; the candidate should be skipped.
    #[error("locked by another instance (lock mtime {age_secs}s ago)")]
    Held { age_secs: u64 },

    /// The lock exists but could not be inspected.
    #[error("cannot stat lock {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    /// Creating the lock failed for a reason other than contention.
    #[error("lock error: {0}")]
    Create(io::Error),

    /// The stale lock was broken but the follow-up create still failed.
    #[error("lock retry failed: {0}")]
    RetryFailed(io::Error),
}

/// RAII guard; dropping it removes the lock file.
pub struct LockGuard {
    fs: Arc<dyn Vfs>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.fs.remove(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not remove lock {}: {e}", self.path.display());
            }
        }
    }
}

/// Acquires the lock for `input`, breaking a stale one (older than
/// `timeout`) with exactly one retry.
pub fn acquire(
    fs: Arc<dyn Vfs>,
    input: &Path,
    timeout: Duration,
) -> Result<LockGuard, LockError> {
    let lock_path = paths::lock_path(input);

    match try_create(fs.as_ref(), &lock_path) {
        Ok(()) => {
            return Ok(LockGuard {
                fs,
                path: lock_path,
            })
        }
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
            return Err(LockError::Create(e))
        }
        Err(_) => {}
    }

    let meta = fs.stat(&lock_path).map_err(|source| LockError::Stat {
        path: lock_path.clone(),
        source,
    })?;
    let age = SystemTime::now()
        .duration_since(meta.modified)
        .unwrap_or(Duration::ZERO);
    if age < timeout {
        return Err(LockError::Held {
            age_secs: age.as_secs(),
        });
    }

    info!(
        "breaking stale lock {} (age {}m)",
        lock_path.display(),
        age.as_secs() / 60
    );
    let _ = fs.remove(&lock_path);

    try_create(fs.as_ref(), &lock_path).map_err(LockError::RetryFailed)?;
    Ok(LockGuard {
        fs,
        path: lock_path,
    })
}

fn try_create(fs: &dyn Vfs, lock_path: &Path) -> io::Result<()> {
    let mut file = fs.create_exclusive(lock_path)?;
    let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
    writeln!(file, "{} {stamp}", paths::hostname())?;
    Ok(())
}
