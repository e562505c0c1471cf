//! Filesystem abstraction so the scanner and converter work transparently
//! over a local directory tree or an SSH/SFTP remote host.
//!
//! The trait is deliberately synchronous: every operation is a single
//! round-trip or a streaming read/write, and the long-running work (the
//! encode itself) never goes through it. Callers that must not stall the
//! runtime wrap the slow calls (`copy_to_local`, probes) in
//! `spawn_blocking`.

mod local;
mod sftp;

pub use local::LocalFs;
pub use sftp::{dial_ssh, SftpFs};

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

/// The subset of `stat` the pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub is_dir: bool,
    pub len: u64,
    pub modified: SystemTime,
}

/// Returned by a walk visitor to steer the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep going; descend into the entry if it is a directory.
    Continue,
    /// Do not descend into this directory (no-op for files).
    SkipSubtree,
    /// Abandon the walk entirely.
    Stop,
}

/// Captured output of a finished subprocess run through [`Vfs::exec`].
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Uniform operations over a local tree or a remote tree behind SSH.
///
/// The walk contract matters: visitors are called depth-first with each
/// directory's entries sorted by file name, which makes the visit order equal
/// to ascending [`crate::paths::path_key`] order. The index merge-join
/// depends on this.
pub trait Vfs: Send + Sync {
    /// Walks `root` depth-first in sorted order, visiting directories before
    /// their contents. Entries that cannot be read are skipped.
    fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&Path, &FileMeta) -> WalkControl,
    ) -> io::Result<()>;

    fn stat(&self, path: &Path) -> io::Result<FileMeta>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Creates (truncating) a file for writing.
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Opens for appending, creating the file if absent.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Creates a file that must not already exist. Fails with
    /// `ErrorKind::AlreadyExists` when it does; the lock protocol depends on
    /// that error kind being distinguishable.
    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Downloads a file to a local path. A plain copy on the local backend.
    fn copy_to_local(&self, path: &Path, local: &Path) -> io::Result<()>;

    /// Uploads a local file. A plain copy on the local backend.
    fn copy_from_local(&self, local: &Path, path: &Path) -> io::Result<()>;

    /// Runs a program where the files live: directly for the local backend,
    /// over a fresh SSH session channel for the remote one. Only used for
    /// short probe invocations.
    fn exec(&self, program: &str, args: &[OsString]) -> io::Result<ExecOutput>;

    fn is_remote(&self) -> bool;
}
