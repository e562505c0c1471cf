//! Library scanner: walks the tree, merge-joins against the previous index,
//! writes the next index, and streams conversion candidates worst-first.
//!
//! The walk and the index share one sort order (see
//! [`crate::paths::path_key`]), so the join needs a single pass and one
//! entry of lookahead. Probing is the expensive step; the index exists so a
//! file is probed once and then never again until it changes.

use crate::failures;
use crate::ffmpeg::Prober;
use crate::index::{self, IndexReader, IndexWriter, CODEC_OURS, CODEC_PROBE_FAILED};
use crate::paths::{self, MIN_SIZE};
use crate::vfs::{Vfs, WalkControl};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mid-scan flush cadence: every this many buffered candidates, one
/// non-blocking attempt to hand the current best to the converter.
const FLUSH_EVERY: usize = 1000;

/// Files modified within this window are left alone; they may still be
/// downloading or getting seeded.
const STALE_AGE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// A lock whose mtime is within this window marks a file another instance is
/// actively scanning or converting.
const LOCK_FRESHNESS: Duration = Duration::from_secs(10 * 60);

/// Container extensions eligible for conversion.
const MOVIE_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "m4v", "mpg", "mpeg", "ts", "webm", "vob",
];

/// Directories that belong to other software and must never be touched.
const SKIP_DIRS: &[&str] = &[
    ".cache",
    ".config",
    ".local",
    ".steam",
    "steam",
    "Steam",
    "SteamLibrary",
    "lib",
    "lib64",
    "lib32",
    "node_modules",
    ".git",
    ".svn",
    ".thumbnails",
    ".Trash",
    ".Trash-1000",
    "lost+found",
    "snap",
    "flatpak",
    "__pycache__",
    ".venv",
    "venv",
    "AppData",
    "Application Support",
    "Caches",
    "Library",
];

/// A file worth re-encoding, ranked by how much space its codec wastes.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub codec: String,
    pub waste_score: f64,
}

/// Multiplier rewarding worse codecs: the score is `size * multiplier`, so
/// an old MPEG-2 rip outranks an H.264 file of the same size.
pub fn codec_waste_multiplier(codec: &str) -> f64 {
    match codec.to_ascii_lowercase().as_str() {
        "mpeg1video" | "mpeg2video" => 4.0,
        "msmpeg4v1" | "msmpeg4v2" | "msmpeg4v3" | "wmv1" | "wmv2" | "wmv3" => 3.5,
        "mpeg4" => 3.0,
        "vp8" => 2.5,
        "h264" => 2.0,
        "hevc" => 1.4,
        "vp9" => 1.3,
        _ => 2.0,
    }
}

fn is_movie_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| MOVIE_EXTENSIONS.contains(&e.as_str()))
}

fn mod_unix(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn is_locked(fs: &dyn Vfs, path: &Path, now: SystemTime) -> bool {
    let Ok(meta) = fs.stat(&paths::lock_path(path)) else {
        return false;
    };
    now.duration_since(meta.modified)
        .map(|age| age < LOCK_FRESHNESS)
        .unwrap_or(true) // lock mtime in the future counts as fresh
}

fn output_exists(fs: &dyn Vfs, path: &Path) -> bool {
    fs.stat(&paths::output_path(path)).is_ok()
}

/// Walks `root`, emitting candidates on `out` until the walk finishes or
/// `cancel` fires. The channel closes when the sender drops at return.
///
/// Runs blocking IO throughout; callers put it on a blocking thread.
pub fn scan(
    fs: &dyn Vfs,
    prober: &dyn Prober,
    root: &Path,
    out: mpsc::Sender<Candidate>,
    cancel: &CancellationToken,
) {
    let now = SystemTime::now();
    let cutoff = now - STALE_AGE;
    let failures = failures::load(fs, root);

    let (reader_path, writer_path) = index::prepare(fs, root);
    let mut reader = IndexReader::open(fs, &reader_path);

    let mut writer = match IndexWriter::create(fs, &writer_path) {
        Ok(writer) => writer,
        Err(e) => {
            warn!("scan: cannot create index {}: {e}", writer_path.display());
            return;
        }
    };

    let mut buf: Vec<Candidate> = Vec::new();
    let mut scanned: usize = 0;

    {
        let enqueue = |buf: &mut Vec<Candidate>,
                       scanned: &mut usize,
                       path: &Path,
                       codec: &str,
                       size: u64| {
            buf.push(Candidate {
                path: path.to_path_buf(),
                size,
                codec: codec.to_string(),
                waste_score: size as f64 * codec_waste_multiplier(codec),
            });
            *scanned += 1;
            if *scanned % FLUSH_EVERY == 0 {
                try_flush_best(buf, &out);
            }
        };

        let mut visit = |path: &Path, meta: &crate::vfs::FileMeta| -> WalkControl {
            if cancel.is_cancelled() {
                return WalkControl::Stop;
            }
            if meta.is_dir {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if SKIP_DIRS.contains(&name) {
                    return WalkControl::SkipSubtree;
                }
                return WalkControl::Continue;
            }

            if !is_movie_extension(path) {
                return WalkControl::Continue;
            }
            let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if paths::is_work_file(basename) {
                return WalkControl::Continue;
            }
            if failures.contains(path) {
                return WalkControl::Continue;
            }
            if is_locked(fs, path, now) {
                return WalkControl::Continue;
            }

            let size = meta.len;
            let modified = meta.modified;
            let path_str = path.to_string_lossy();

            if let Some(cached) = reader.advance_to(&path_str, mod_unix(modified), size) {
                let _ = writer.write(&path_str, &cached, mod_unix(modified), size);
                if size < MIN_SIZE
                    || modified >= cutoff
                    || cached == CODEC_PROBE_FAILED
                    || cached == "av1"
                    || cached == CODEC_OURS
                {
                    return WalkControl::Continue;
                }
                if output_exists(fs, path) {
                    return WalkControl::Continue;
                }
                enqueue(&mut buf, &mut scanned, path, &cached, size);
                return WalkControl::Continue;
            }

            // Cache miss. Small or too-fresh files are not even worth a
            // probe; they get no index entry until they settle.
            if size < MIN_SIZE || modified >= cutoff {
                return WalkControl::Continue;
            }

            let codec = match prober.video_codec(path) {
                Ok(codec) => codec.to_ascii_lowercase(),
                Err(e) => {
                    info!("scan: skipping {} (probe failed: {e})", path.display());
                    let _ = writer.write(&path_str, CODEC_PROBE_FAILED, mod_unix(modified), size);
                    return WalkControl::Continue;
                }
            };

            if codec == "av1" {
                let comment = prober.comment(path).unwrap_or_default();
                let tag = if comment == paths::META_COMMENT {
                    CODEC_OURS
                } else {
                    "av1"
                };
                let _ = writer.write(&path_str, tag, mod_unix(modified), size);
                return WalkControl::Continue;
            }

            let _ = writer.write(&path_str, &codec, mod_unix(modified), size);
            if output_exists(fs, path) {
                return WalkControl::Continue;
            }
            enqueue(&mut buf, &mut scanned, path, &codec, size);
            WalkControl::Continue
        };

        if let Err(e) = fs.walk(root, &mut visit) {
            warn!("scan: walk failed: {e}");
        }
    }

    flush_all(&mut buf, &out, cancel);

    drop(reader);
    let interrupted = cancel.is_cancelled();
    match writer.finish() {
        Ok(written) if !interrupted => index::finish(fs, &reader_path, written),
        Ok(_) => info!("scan interrupted, keeping previous index"),
        Err(e) => warn!("scan: index write error: {e}"),
    }

    info!("scan complete: {scanned} conversion candidates evaluated");
}

fn sort_by_waste_desc(buf: &mut [Candidate]) {
    buf.sort_by(|a, b| {
        b.waste_score
            .partial_cmp(&a.waste_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Non-blocking send of the highest-waste candidate. If the consumer is
/// busy encoding, the candidate stays buffered for the end-of-scan drain.
fn try_flush_best(buf: &mut Vec<Candidate>, out: &mpsc::Sender<Candidate>) {
    if buf.is_empty() {
        return;
    }
    sort_by_waste_desc(buf);
    if out.try_send(buf[0].clone()).is_ok() {
        buf.remove(0);
    }
}

/// Blocking drain of every remaining candidate in descending waste order.
fn flush_all(buf: &mut Vec<Candidate>, out: &mpsc::Sender<Candidate>, cancel: &CancellationToken) {
    sort_by_waste_desc(buf);
    while !buf.is_empty() {
        if cancel.is_cancelled() {
            return;
        }
        if out.blocking_send(buf.remove(0)).is_err() {
            return; // consumer is gone
        }
    }
}

/// Human-readable byte size, binary units.
pub fn human_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}iB",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}
