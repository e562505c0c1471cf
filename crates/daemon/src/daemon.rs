//! Daemon entry point and main loop: consume ranked candidates one at a
//! time, convert, validate, and retire the originals, forever.
//!
//! One encode runs at any moment by design; the encoder saturates the
//! machine on its own, and everything around it is bookkeeping.

use crate::console::{spawn_console, Status};
use crate::cpu::{self, BASELINE_GHZ};
use crate::failures;
use crate::ffmpeg::{
    Av1Options, EncodeError, FfmpegAdapter, HwCaps, HwProfile, ProgressFn, Prober, VfsProber,
};
use crate::lock;
use crate::paths;
use crate::scan::{self, human_size, Candidate};
use crate::validate::{self, ValidateError};
use crate::vfs::Vfs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sleep between scans that found nothing to do.
const IDLE_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

/// Hours per GB that a baseline machine (one thread at [`BASELINE_GHZ`])
/// would need, before the safety multiplier.
const BASE_RATE_HOURS: f64 = 3.0;
const SAFETY_MULT: f64 = 3.0;
const MIN_TIMEOUT_HOURS: f64 = 4.0;
const MAX_TIMEOUT_HOURS: f64 = 96.0;

/// Codecs bad enough to deserve the fast hardware HEVC pass when AV1
/// hardware is absent.
const HEVC_FIRST_CODECS: &[&str] = &[
    "h264", "mpeg4", "mpeg2video", "mpeg1video", "msmpeg4v1", "msmpeg4v2", "msmpeg4v3", "wmv1",
    "wmv2", "wmv3", "vp8",
];

/// Runtime configuration, fully determined by the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory to watch, local or on the remote host.
    pub root: PathBuf,
    /// Keep originals, renamed with the `_deleteMe` tag, instead of
    /// deleting them.
    pub no_delete: bool,
}

/// Unrecoverable startup error.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("startup failed: {0}")]
    Startup(#[from] EncodeError),
}

/// Per-candidate conversion error. Logged, never propagated: every
/// candidate is independent.
#[derive(Debug, Error)]
enum ConvertError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("scratch dir: {0}")]
    Scratch(io::Error),

    #[error("download failed: {0}")]
    Download(io::Error),

    #[error("upload failed: {0}")]
    Upload(io::Error),

    #[error("remote rename failed: {0}")]
    RemoteRename(io::Error),
}

/// Runs the daemon until a stop is requested: scan, drain candidates, and
/// when a scan comes up empty, sleep a day and go again.
///
/// `hard_abort` (usually wired to SIGINT/SIGTERM) cancels the running
/// encode too; the graceful path is the console's `q`, which only stops
/// scanning and lets the in-flight encode finish.
pub async fn run(
    cfg: Config,
    fs: Arc<dyn Vfs>,
    hard_abort: CancellationToken,
) -> Result<(), DaemonError> {
    let enc = Arc::new(FfmpegAdapter::new());
    enc.ensure_available()?;

    let status = Arc::new(Status::new());
    let scan_cancel = hard_abort.child_token();
    let _console = spawn_console(status.clone(), scan_cancel.clone());

    let hw = enc.detect_hw();
    let threads = cpu::encode_threads();
    let ghz = cpu::cpu_ghz();
    let score = threads as f64 * (ghz / BASELINE_GHZ);
    let rate_per_gb = (BASE_RATE_HOURS / score) * SAFETY_MULT;
    info!(
        "flicksqueeze watching {} (threads={threads}, cpu={ghz:.1} GHz, ~{rate_per_gb:.1}h timeout per GB)",
        cfg.root.display()
    );
    if let Some(profile) = hw.hevc_profile.filter(|_| hw.use_hevc_first()) {
        info!(
            "HEVC hw available ({}): will convert worst codecs to HEVC first, AV1 after",
            profile.name
        );
    }
    if fs.is_remote() {
        info!("remote mode: files will be downloaded for local encoding");
    }
    info!("press Enter for status, q+Enter to quit");

    let prober: Arc<dyn Prober> = Arc::new(VfsProber::new(enc.clone(), fs.clone()));
    let pipeline = Pipeline {
        fs: fs.clone(),
        enc: enc.clone(),
        prober,
        hw,
        root: cfg.root.clone(),
        no_delete: cfg.no_delete,
        score,
        status: status.clone(),
        hard_abort: hard_abort.clone(),
    };

    loop {
        let (tx, mut rx) = mpsc::channel::<Candidate>(1);
        let scan_task = {
            let fs = fs.clone();
            let enc = enc.clone();
            let root = cfg.root.clone();
            let cancel = scan_cancel.clone();
            tokio::task::spawn_blocking(move || {
                let prober = VfsProber::new(enc, fs.clone());
                scan::scan(fs.as_ref(), &prober, &root, tx, &cancel);
            })
        };

        let mut processed = 0usize;
        while let Some(candidate) = rx.recv().await {
            if scan_cancel.is_cancelled() {
                break;
            }
            processed += 1;
            info!(
                "candidate {processed}: [{}] {} ({}, codec={})",
                human_size(candidate.size),
                candidate.path.display(),
                fmt_waste(candidate.waste_score),
                candidate.codec
            );
            pipeline.process(candidate).await;
            if scan_cancel.is_cancelled() {
                break;
            }
        }
        drop(rx); // unblocks the scanner's drain if we left early
        let _ = scan_task.await;

        if scan_cancel.is_cancelled() {
            return Ok(());
        }

        if processed == 0 {
            info!("no conversion candidates found, sleeping 24 hours");
            tokio::select! {
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
                _ = scan_cancel.cancelled() => return Ok(()),
            }
        }
    }
}

/// Per-file encode deadline: scales linearly with size (a stand-in for
/// duration, resolution, and bitrate) and inversely with machine
/// throughput, clamped to a sane window.
fn encode_timeout(score: f64, size: u64) -> Duration {
    let gb = size as f64 / (1024.0 * 1024.0 * 1024.0);
    let hours = ((BASE_RATE_HOURS / score) * SAFETY_MULT * gb)
        .clamp(MIN_TIMEOUT_HOURS, MAX_TIMEOUT_HOURS);
    Duration::from_secs_f64(hours * 3600.0)
}

fn hevc_first_codec(codec: &str) -> bool {
    HEVC_FIRST_CODECS.contains(&codec.to_ascii_lowercase().as_str())
}

fn fmt_waste(score: f64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    if score >= GB {
        format!("waste={:.1} GiB", score / GB)
    } else {
        format!("waste={:.0} MiB", score / MB)
    }
}

/// Everything one candidate needs, bundled so the loop body stays readable.
struct Pipeline {
    fs: Arc<dyn Vfs>,
    enc: Arc<FfmpegAdapter>,
    /// Probes routed to where the files live; also the validation seam.
    prober: Arc<dyn Prober>,
    hw: HwCaps,
    root: PathBuf,
    no_delete: bool,
    score: f64,
    status: Arc<Status>,
    hard_abort: CancellationToken,
}

impl Pipeline {
    /// Converts one candidate end to end. Every failure is terminal for
    /// this candidate only.
    async fn process(&self, c: Candidate) {
        let timeout = encode_timeout(self.score, c.size);
        let _lock = match lock::acquire(self.fs.clone(), &c.path, timeout) {
            Ok(guard) => guard,
            Err(e) => {
                info!("skipping {}: {e}", c.path.display());
                return;
            }
        };

        // The input may have changed or vanished since the scan.
        let meta = match self.fs.stat(&c.path) {
            Ok(meta) => meta,
            Err(_) => {
                info!("skipping {}: file no longer exists", c.path.display());
                return;
            }
        };
        if meta.len != c.size {
            info!(
                "skipping {}: size changed since scan ({} -> {})",
                c.path.display(),
                c.size,
                meta.len
            );
            return;
        }

        let out_path = paths::output_path(&c.path);

        // Collision / restart detection on the output name.
        if self.fs.stat(&out_path).is_ok() {
            let comment = self.probe_comment(&out_path).await;
            if !paths::is_our_comment(&comment) {
                info!(
                    "skipping {}: output {} already exists (not ours)",
                    c.path.display(),
                    out_path.display()
                );
                return;
            }
            if self.validate(&c.path, &out_path, c.size).await.is_ok() {
                info!(
                    "restart recovery: {} already converted, finishing up",
                    c.path.display()
                );
                let enc_type = if comment == paths::HEVC_META_COMMENT {
                    "hevc"
                } else {
                    "av1"
                };
                self.finish_conversion(&c, &out_path, enc_type);
                return;
            }
            info!(
                "stale output {} from previous failed run, removing",
                out_path.display()
            );
            let _ = self.fs.remove(&out_path);
        }

        let profile = self
            .hw
            .hevc_profile
            .filter(|_| self.hw.use_hevc_first() && hevc_first_codec(&c.codec));
        let enc_type: &'static str = if profile.is_some() { "hevc" } else { "av1" };

        self.status.start_encode(&c.path, &c.codec, enc_type, c.size);
        let status = self.status.clone();
        let progress: ProgressFn = Arc::new(move |line: &str| status.update_progress(line));

        let result = if self.fs.is_remote() {
            self.encode_remote(&c, &out_path, profile, timeout, progress)
                .await
        } else if let Some(profile) = profile {
            self.encode_hevc(&c.path, &out_path, profile, timeout, progress)
                .await
                .map_err(ConvertError::from)
        } else {
            self.encode_av1(&c.path, &out_path, timeout, progress)
                .await
                .map_err(ConvertError::from)
        };

        if let Err(e) = result {
            warn!("encode failed for {}: {e}", c.path.display());
            let _ = self.fs.remove(&out_path);
            if !self.hard_abort.is_cancelled() {
                failures::mark_failed(self.fs.as_ref(), &self.root, &c.path);
            }
            return;
        }

        // Validation probes run where the output lives, remote included.
        if let Err(e) = self.validate(&c.path, &out_path, c.size).await {
            warn!("validation failed for {}: {e}", c.path.display());
            let _ = self.fs.remove(&out_path);
            if !self.hard_abort.is_cancelled() {
                failures::mark_failed(self.fs.as_ref(), &self.root, &c.path);
            }
            return;
        }

        self.finish_conversion(&c, &out_path, enc_type);
    }

    /// Container comment of `path`, empty on any probe trouble.
    async fn probe_comment(&self, path: &Path) -> String {
        let prober = self.prober.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || prober.comment(&path).unwrap_or_default())
            .await
            .unwrap_or_default()
    }

    async fn validate(
        &self,
        input: &Path,
        output: &Path,
        input_size: u64,
    ) -> Result<(), ValidateError> {
        let fs = self.fs.clone();
        let prober = self.prober.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        match tokio::task::spawn_blocking(move || {
            validate::validate(fs.as_ref(), prober.as_ref(), &input, &output, input_size)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(ValidateError::StatOutput(io::Error::other(e.to_string()))),
        }
    }

    /// Download, encode locally, upload to a transport-tagged temp name,
    /// then rename into place. The scratch directory is recreated per
    /// candidate and removed whatever happens.
    async fn encode_remote(
        &self,
        c: &Candidate,
        out_path: &Path,
        profile: Option<&'static HwProfile>,
        timeout: Duration,
        progress: ProgressFn,
    ) -> Result<(), ConvertError> {
        let scratch = std::env::temp_dir().join("flicksqueeze-work");
        // Clean stale files from a previous crash, then recreate.
        let _ = std::fs::remove_dir_all(&scratch);
        std::fs::create_dir_all(&scratch).map_err(ConvertError::Scratch)?;

        let result = self
            .encode_remote_inner(&scratch, c, out_path, profile, timeout, progress)
            .await;
        let _ = std::fs::remove_dir_all(&scratch);
        result
    }

    async fn encode_remote_inner(
        &self,
        scratch: &Path,
        c: &Candidate,
        out_path: &Path,
        profile: Option<&'static HwProfile>,
        timeout: Duration,
        progress: ProgressFn,
    ) -> Result<(), ConvertError> {
        let ext = c
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let local_in = scratch.join(format!("input{ext}"));
        let local_out = scratch.join(format!("output{}", paths::OUTPUT_EXT));

        info!("downloading {}...", c.path.display());
        run_transfer(self.fs.clone(), c.path.clone(), local_in.clone(), true)
            .await
            .map_err(ConvertError::Download)?;

        match profile {
            Some(profile) => {
                self.encode_hevc(&local_in, &local_out, profile, timeout, progress)
                    .await?
            }
            None => self.encode_av1(&local_in, &local_out, timeout, progress).await?,
        }

        let remote_tmp = paths::tmp_sibling(out_path, "upload");
        info!("uploading result to {}...", remote_tmp.display());
        run_transfer(self.fs.clone(), remote_tmp.clone(), local_out.clone(), false)
            .await
            .map_err(ConvertError::Upload)?;

        if let Err(e) = self.fs.rename(&remote_tmp, out_path) {
            let _ = self.fs.remove(&remote_tmp);
            return Err(ConvertError::RemoteRename(e));
        }
        Ok(())
    }

    /// Software AV1 encode with one subtitle-dropping retry.
    async fn encode_av1(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
        progress: ProgressFn,
    ) -> Result<(), EncodeError> {
        info!("AV1 sw encode {} -> {}", input.display(), output.display());

        let mut opts = Av1Options {
            threads: cpu::encode_threads(),
            skip_if_already_av1: true,
            meta_comment: paths::META_COMMENT.to_string(),
            ..Av1Options::default()
        };

        let first = self
            .enc
            .encode_to_av1_svt(input, output, &opts, Some(progress.clone()), timeout, &self.hard_abort)
            .await;
        match first {
            Err(e)
                if !matches!(e, EncodeError::AlreadyAv1) && !self.hard_abort.is_cancelled() =>
            {
                warn!("AV1 encode failed (retrying without subtitles): {e}");
                let _ = std::fs::remove_file(output);
                opts.drop_subtitles = true;
                self.enc
                    .encode_to_av1_svt(input, output, &opts, Some(progress), timeout, &self.hard_abort)
                    .await
            }
            other => other,
        }
    }

    /// Hardware HEVC encode with one subtitle-dropping retry.
    async fn encode_hevc(
        &self,
        input: &Path,
        output: &Path,
        profile: &'static HwProfile,
        timeout: Duration,
        progress: ProgressFn,
    ) -> Result<(), EncodeError> {
        info!("HEVC hw encode {} -> {}", input.display(), output.display());

        let first = self
            .enc
            .encode_to_hevc_hw(
                input,
                output,
                profile,
                paths::HEVC_META_COMMENT,
                false,
                Some(progress.clone()),
                timeout,
                &self.hard_abort,
            )
            .await;
        match first {
            Err(e) if !self.hard_abort.is_cancelled() => {
                warn!("HEVC encode failed (retrying without subtitles): {e}");
                let _ = std::fs::remove_file(output);
                self.enc
                    .encode_to_hevc_hw(
                        input,
                        output,
                        profile,
                        paths::HEVC_META_COMMENT,
                        true,
                        Some(progress),
                        timeout,
                        &self.hard_abort,
                    )
                    .await
            }
            other => other,
        }
    }

    /// The validated output replaces the original: retire the input, strip
    /// the `.av1tmp` infix if present, and append the tally line.
    fn finish_conversion(&self, c: &Candidate, out_path: &Path, enc_type: &'static str) {
        let out_meta = match self.fs.stat(out_path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("cannot stat output {}: {e}", out_path.display());
                return;
            }
        };
        let out_size = out_meta.len;
        let saved = c.size.saturating_sub(out_size);
        self.status.finish_encode(saved);
        info!(
            "validated OK [{enc_type}]: {} saved ({} -> {})",
            human_size(saved),
            human_size(c.size),
            human_size(out_size)
        );

        self.retire_original(&c.path);

        let mut final_path = out_path.to_path_buf();
        let base = out_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if base.contains(paths::AV1_TMP_TAG) {
            let renamed = out_path.with_file_name(base.replacen(paths::AV1_TMP_TAG, "", 1));
            if let Err(e) = self.fs.rename(out_path, &renamed) {
                warn!(
                    "rename {} -> {} failed: {e}",
                    out_path.display(),
                    renamed.display()
                );
                return;
            }
            final_path = renamed;
        }

        self.append_tally(enc_type, &c.codec, &c.path, c.size, &final_path, out_size);
        info!("done: {}", final_path.display());
    }

    fn retire_original(&self, path: &Path) {
        if self.no_delete {
            let tagged = paths::delete_me_path(path);
            if let Err(e) = self.fs.rename(path, &tagged) {
                warn!(
                    "could not rename original {} -> {}: {e}",
                    path.display(),
                    tagged.display()
                );
            }
            return;
        }
        if let Err(e) = self.fs.remove(path) {
            warn!("could not remove original {}: {e}", path.display());
        }
    }

    /// Best-effort append of one TSV line to the tally log.
    fn append_tally(
        &self,
        enc_type: &str,
        from_codec: &str,
        input: &Path,
        before: u64,
        output: &Path,
        after: u64,
    ) {
        let Ok(mut w) = self.fs.open_append(&self.root.join(paths::TALLY_FILE)) else {
            return;
        };
        let stamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
        let _ = writeln!(
            w,
            "{stamp}\t{enc_type}\t{from_codec}\t{before}\t{after}\t{}\t{}",
            input.display(),
            output.display()
        );
    }
}

/// Runs one SFTP transfer on the blocking pool. `download` picks the
/// direction.
async fn run_transfer(
    fs: Arc<dyn Vfs>,
    remote: PathBuf,
    local: PathBuf,
    download: bool,
) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if download {
            fs.copy_to_local(&remote, &local)
        } else {
            fs.copy_from_local(&local, &remote)
        }
    })
    .await
    .map_err(|e| io::Error::other(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::MIN_SIZE;
    use crate::test_support::FakeProber;
    use crate::vfs::LocalFs;
    use std::fs;
    use tempfile::TempDir;

    fn pipeline(root: &Path, no_delete: bool, prober: FakeProber) -> Pipeline {
        Pipeline {
            fs: Arc::new(LocalFs),
            enc: Arc::new(FfmpegAdapter {
                ffmpeg: "/nonexistent/ffmpeg".to_string(),
                ffprobe: "/nonexistent/ffprobe".to_string(),
            }),
            prober: Arc::new(prober),
            hw: HwCaps::default(),
            root: root.to_path_buf(),
            no_delete,
            score: 10.0,
            status: Arc::new(Status::new()),
            hard_abort: CancellationToken::new(),
        }
    }

    fn candidate(path: &Path, size: u64, codec: &str) -> Candidate {
        Candidate {
            path: path.to_path_buf(),
            size,
            codec: codec.to_string(),
            waste_score: size as f64 * 2.0,
        }
    }

    #[test]
    fn timeout_clamps_and_scales() {
        // score 1.0 => 9h per GB.
        let one_gb = 1u64 << 30;
        let t = encode_timeout(1.0, one_gb);
        assert_eq!(t.as_secs(), 9 * 3600);

        // Tiny files hit the lower clamp.
        assert_eq!(encode_timeout(1.0, 1).as_secs(), 4 * 3600);
        // Enormous files hit the upper clamp.
        assert_eq!(encode_timeout(1.0, one_gb * 1000).as_secs(), 96 * 3600);
        // Faster machines get shorter deadlines.
        assert!(encode_timeout(8.0, one_gb * 4) < encode_timeout(1.0, one_gb * 4));
    }

    #[test]
    fn hevc_first_codec_set() {
        for codec in ["h264", "H264", "mpeg2video", "wmv3", "vp8"] {
            assert!(hevc_first_codec(codec), "{codec} should HEVC-first");
        }
        for codec in ["hevc", "vp9", "av1", "prores"] {
            assert!(!hevc_first_codec(codec), "{codec} should not HEVC-first");
        }
    }

    #[test]
    fn fmt_waste_units() {
        assert_eq!(fmt_waste(2.5 * 1024.0 * 1024.0 * 1024.0), "waste=2.5 GiB");
        assert_eq!(fmt_waste(500.0 * 1024.0 * 1024.0), "waste=500 MiB");
    }

    #[tokio::test]
    async fn foreign_output_is_never_touched() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("a.avi");
        fs::write(&input, vec![0u8; 1024]).unwrap();
        let foreign = root.join("a.mkv");
        fs::write(&foreign, b"somebody else's file").unwrap();

        // No comment data: the probe yields "", which is not ours.
        let p = pipeline(root, false, FakeProber::new());
        p.process(candidate(&input, 1024, "mpeg2video")).await;

        assert!(input.exists(), "input must be untouched");
        assert_eq!(
            fs::read(&foreign).unwrap(),
            b"somebody else's file",
            "foreign output must be untouched"
        );
        assert!(!root.join(paths::TALLY_FILE).exists(), "no tally for a skip");
        assert!(
            !root.join(failures::FAILURES_FILE).exists(),
            "a collision is not a failure"
        );
        assert!(!paths::lock_path(&input).exists(), "lock must be released");
    }

    #[tokio::test]
    async fn restart_recovery_finishes_without_reencoding() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("b.mp4");
        fs::write(&input, vec![0u8; (3 * MIN_SIZE) as usize]).unwrap();
        let output = root.join("b.mkv");
        fs::write(&output, vec![0u8; MIN_SIZE as usize]).unwrap();

        let prober = FakeProber::new()
            .with_comment(&output, paths::META_COMMENT)
            .with_duration(&input, 5400.0)
            .with_duration(&output, 5399.0);
        let p = pipeline(root, false, prober);
        p.process(candidate(&input, 3 * MIN_SIZE, "h264")).await;

        assert!(!input.exists(), "original must be retired");
        assert!(output.exists(), "recovered output must remain");

        let tally = fs::read_to_string(root.join(paths::TALLY_FILE)).unwrap();
        let fields: Vec<&str> = tally.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], "av1");
        assert_eq!(fields[2], "h264");
        assert_eq!(fields[3], (3 * MIN_SIZE).to_string());
        assert_eq!(fields[4], MIN_SIZE.to_string());
        assert!(fields[6].ends_with("b.mkv"));
    }

    #[tokio::test]
    async fn changed_input_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("c.avi");
        fs::write(&input, vec![0u8; 2048]).unwrap();

        let p = pipeline(root, false, FakeProber::new());
        // The scan saw 1024 bytes; the file has since grown.
        p.process(candidate(&input, 1024, "h264")).await;

        assert!(input.exists());
        assert!(!root.join("c.mkv").exists());
        assert!(!root.join(failures::FAILURES_FILE).exists());
    }

    #[tokio::test]
    async fn fresh_lock_skips_without_failure_mark() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("c.mkv");
        fs::write(&input, vec![0u8; 1024]).unwrap();
        fs::write(paths::lock_path(&input), b"otherhost stamp\n").unwrap();

        let p = pipeline(root, false, FakeProber::new());
        p.process(candidate(&input, 1024, "h264")).await;

        assert!(input.exists());
        assert!(
            paths::lock_path(&input).exists(),
            "the other instance's lock must survive"
        );
        assert!(!root.join(failures::FAILURES_FILE).exists());
    }

    #[tokio::test]
    async fn stale_our_output_is_removed_and_failure_marked_on_reencode_error() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("d.avi");
        fs::write(&input, vec![0u8; (2 * MIN_SIZE) as usize]).unwrap();
        let output = root.join("d.mkv");
        fs::write(&output, vec![0u8; MIN_SIZE as usize]).unwrap();

        // Ours by comment, but the durations disagree: stale.
        let prober = FakeProber::new()
            .with_comment(&output, paths::META_COMMENT)
            .with_duration(&input, 5400.0)
            .with_duration(&output, 10.0);
        let p = pipeline(root, false, prober);
        p.process(candidate(&input, 2 * MIN_SIZE, "h264")).await;

        // The stale output is gone and the re-encode failed (no ffmpeg
        // binary), so the input is marked failed but kept on disk.
        assert!(!output.exists());
        assert!(input.exists());
        let failed = failures::load(&LocalFs, root);
        assert!(failed.contains(&input));
    }

    #[tokio::test]
    async fn finish_conversion_retires_strips_tag_and_tallies() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("movie.mkv");
        fs::write(&input, vec![0u8; 4096]).unwrap();
        let output = root.join("movie.av1tmp.mkv");
        fs::write(&output, vec![0u8; 1024]).unwrap();

        let p = pipeline(root, true, FakeProber::new()); // --no-delete
        p.finish_conversion(&candidate(&input, 4096, "h264"), &output, "av1");

        // Original renamed out of the way, not deleted.
        assert!(!input.exists());
        assert!(root.join("movie_deleteMe.mkv").exists());
        // The .av1tmp infix is stripped on the final rename.
        assert!(!output.exists());
        assert!(root.join("movie.mkv").exists());

        let tally = fs::read_to_string(root.join(paths::TALLY_FILE)).unwrap();
        let fields: Vec<&str> = tally.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], "av1");
        assert!(fields[6].ends_with("movie.mkv"));
        assert!(!fields[6].contains(paths::AV1_TMP_TAG));
    }

    #[tokio::test]
    async fn finish_conversion_deletes_original_by_default() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let input = root.join("movie.avi");
        fs::write(&input, vec![0u8; 4096]).unwrap();
        let output = root.join("movie.mkv");
        fs::write(&output, vec![0u8; 1024]).unwrap();

        let p = pipeline(root, false, FakeProber::new());
        p.finish_conversion(&candidate(&input, 4096, "mpeg4"), &output, "av1");

        assert!(!input.exists());
        assert!(output.exists());
        let tally = fs::read_to_string(root.join(paths::TALLY_FILE)).unwrap();
        assert!(tally.contains("\tmpeg4\t"));
    }
}
