//! Durable set of paths that permanently failed conversion.
//!
//! A newline-delimited file in the scanned root. Once a path lands here the
//! scanner never offers it again; removing the line by hand is the only way
//! back in.

use crate::vfs::Vfs;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Failure list file name, relative to the scanned root.
pub const FAILURES_FILE: &str = ".flicksqueeze.failures";

/// Loads the failure set. A missing or unreadable file is an empty set.
pub fn load(fs: &dyn Vfs, root: &Path) -> HashSet<PathBuf> {
    let mut set = HashSet::new();
    let Ok(raw) = fs.open(&root.join(FAILURES_FILE)) else {
        return set;
    };
    for line in BufReader::new(raw).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if !line.is_empty() {
            set.insert(PathBuf::from(line));
        }
    }
    set
}

static APPEND_LOCK: Mutex<()> = Mutex::new(());

/// Appends a path to the failure list. Best-effort: errors are logged at
/// debug level and otherwise swallowed, because the pipeline must keep
/// moving even when the root is briefly unwritable.
pub fn mark_failed(fs: &dyn Vfs, root: &Path, path: &Path) {
    let _guard = APPEND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let file = root.join(FAILURES_FILE);
    match fs.open_append(&file) {
        Ok(mut w) => {
            let line = format!("{}\n", path.display());
            if let Err(e) = w.write_all(line.as_bytes()) {
                debug!("could not append to {}: {e}", file.display());
            }
        }
        Err(e) => debug!("could not open {}: {e}", file.display()),
    }
}
