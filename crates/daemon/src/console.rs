//! Interactive console: Enter prints a status snapshot, `q` asks for a
//! graceful stop.
//!
//! The status struct is written by the encoder's progress callback (a
//! blocking reader thread) and read by the console task, so it hides behind
//! a plain mutex rather than anything async.

use crate::scan::human_size;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
struct StatusInner {
    session_start: Instant,
    file: Option<PathBuf>,
    size: u64,
    codec: String,
    enc_type: &'static str,
    started_at: Instant,
    /// Latest `time=` field seen in the encoder's progress stream.
    ffmpeg_time: String,
    /// Latest `speed=` field.
    ffmpeg_speed: String,
    files_total: u64,
    bytes_saved: u64,
}

/// What the converter is doing right now, plus session totals.
#[derive(Debug)]
pub struct Status {
    inner: Mutex<StatusInner>,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Status {
        Status {
            inner: Mutex::new(StatusInner {
                session_start: Instant::now(),
                file: None,
                size: 0,
                codec: String::new(),
                enc_type: "av1",
                started_at: Instant::now(),
                ffmpeg_time: String::new(),
                ffmpeg_speed: String::new(),
                files_total: 0,
                bytes_saved: 0,
            }),
        }
    }

    pub fn start_encode(&self, path: &Path, codec: &str, enc_type: &'static str, size: u64) {
        let mut st = self.lock();
        st.file = Some(path.to_path_buf());
        st.size = size;
        st.codec = codec.to_string();
        st.enc_type = enc_type;
        st.started_at = Instant::now();
        st.ffmpeg_time.clear();
        st.ffmpeg_speed.clear();
    }

    /// Feeds one raw progress line; only lines carrying `time=` matter.
    pub fn update_progress(&self, line: &str) {
        if !line.contains("time=") {
            return;
        }
        let mut st = self.lock();
        if let Some(t) = extract_field(line, "time=") {
            st.ffmpeg_time = t.to_string();
        }
        if let Some(sp) = extract_field(line, "speed=") {
            st.ffmpeg_speed = sp.to_string();
        }
    }

    pub fn finish_encode(&self, saved: u64) {
        let mut st = self.lock();
        st.files_total += 1;
        st.bytes_saved += saved;
        st.file = None;
    }

    /// Prints the snapshot to stderr.
    pub fn print(&self) {
        let st = self.lock();
        eprintln!();
        eprintln!("─── flicksqueeze status ───");
        if let Some(file) = &st.file {
            let elapsed = st.started_at.elapsed().as_secs();
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            eprintln!("  encoding [{}]: {}", st.enc_type, name);
            eprintln!(
                "  codec: {}, size: {}, elapsed: {}m{}s",
                st.codec,
                human_size(st.size),
                elapsed / 60,
                elapsed % 60
            );
            if !st.ffmpeg_time.is_empty() {
                eprintln!(
                    "  progress: time={} speed={}",
                    st.ffmpeg_time, st.ffmpeg_speed
                );
            }
        } else {
            eprintln!("  idle (scanning or waiting)");
        }
        let session_hours = st.session_start.elapsed().as_secs_f64() / 3600.0;
        eprint!(
            "  session: {} files converted, {} saved",
            st.files_total,
            human_size(st.bytes_saved)
        );
        if session_hours >= 0.01 && st.bytes_saved > 0 {
            let per_hour = (st.bytes_saved as f64 / session_hours) as u64;
            eprint!(" ({}/hr)", human_size(per_hour));
        }
        eprintln!();
        eprintln!("───────────────────────────");
        eprintln!("  [q + Enter] quit after current encode");
        eprintln!("  [Enter]     refresh status");
        eprintln!();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pulls `key` out of an ffmpeg stats line: the value runs to the next
/// space.
fn extract_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then_some(value)
}

/// Reads stdin lines: `q`/`Q`/`quit` fires `scan_cancel`, anything else
/// prints the status snapshot. Returns when stdin closes or quit is asked.
pub fn spawn_console(
    status: std::sync::Arc<Status>,
    scan_cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return,
            };
            let line = line.trim();
            if line == "q" || line == "Q" || line == "quit" {
                info!("graceful stop requested; finishing current encode before exit");
                scan_cancel.cancel();
                return;
            }
            status.print();
        }
    })
}
