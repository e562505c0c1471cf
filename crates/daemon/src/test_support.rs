//! Shared fakes for unit tests.

use crate::ffmpeg::{ProbeError, Prober};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// In-memory [`Prober`]: paths map to canned codecs, durations, and
/// comments. Unknown paths fail their codec/duration probes, which is
/// exactly what ffprobe does for unreadable files. Records every codec
/// probe so tests can assert a cached file was not re-probed.
#[derive(Default)]
pub struct FakeProber {
    codecs: HashMap<PathBuf, String>,
    durations: HashMap<PathBuf, f64>,
    comments: HashMap<PathBuf, String>,
    pub codec_probes: Mutex<Vec<PathBuf>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, path: &Path, codec: &str) -> Self {
        self.codecs.insert(path.to_path_buf(), codec.to_string());
        self
    }

    pub fn with_duration(mut self, path: &Path, secs: f64) -> Self {
        self.durations.insert(path.to_path_buf(), secs);
        self
    }

    pub fn with_comment(mut self, path: &Path, comment: &str) -> Self {
        self.comments.insert(path.to_path_buf(), comment.to_string());
        self
    }

    pub fn probed_paths(&self) -> Vec<PathBuf> {
        self.codec_probes.lock().unwrap().clone()
    }
}

impl Prober for FakeProber {
    fn video_codec(&self, path: &Path) -> Result<String, ProbeError> {
        self.codec_probes.lock().unwrap().push(path.to_path_buf());
        self.codecs
            .get(path)
            .cloned()
            .ok_or_else(|| ProbeError::Failed(format!("no probe data for {}", path.display())))
    }

    fn duration_seconds(&self, path: &Path) -> Result<f64, ProbeError> {
        self.durations.get(path).copied().ok_or(ProbeError::NoDuration)
    }

    fn comment(&self, path: &Path) -> Result<String, ProbeError> {
        Ok(self.comments.get(path).cloned().unwrap_or_default())
    }
}
