//! Adapter around the external ffmpeg/ffprobe binaries.
//!
//! Probes run through a [`Vfs`] so they execute where the file lives (an SSH
//! exec channel for remote trees). Encodes always run locally: remote inputs
//! are downloaded first by the orchestrator. Every encode writes to a
//! host-tagged scratch sibling and renames onto the target only on success,
//! so a crash never leaves a half-written file under the final name.

mod proc;

use crate::paths;
use crate::vfs::{LocalFs, Vfs};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback receiving raw progress lines from the encoder's error stream.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Error from an ffprobe invocation.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe could not run: {0}")]
    Exec(#[from] io::Error),

    #[error("ffprobe failed: {0}")]
    Failed(String),

    #[error("could not parse ffprobe output: {0}")]
    Parse(String),

    #[error("no video stream found")]
    NoVideoStream,

    #[error("duration unavailable")]
    NoDuration,
}

/// Error from an encode.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The input is already AV1 and `skip_if_already_av1` was set.
    #[error("input already AV1")]
    AlreadyAv1,

    #[error("{tool} not runnable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("could not start ffmpeg: {0}")]
    Spawn(io::Error),

    #[error("ffmpeg exited with status {status}: {detail}")]
    Failed { status: i32, detail: String },

    #[error("encode exceeded its deadline")]
    TimedOut,

    #[error("encode aborted")]
    Aborted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The three probe operations the scanner and validator need, abstracted so
/// tests can substitute an in-memory fake.
pub trait Prober: Send + Sync {
    fn video_codec(&self, path: &Path) -> Result<String, ProbeError>;
    fn duration_seconds(&self, path: &Path) -> Result<f64, ProbeError>;
    fn comment(&self, path: &Path) -> Result<String, ProbeError>;
}

/// Production [`Prober`]: an adapter bound to the filesystem the files live
/// on.
pub struct VfsProber {
    enc: Arc<FfmpegAdapter>,
    fs: Arc<dyn Vfs>,
}

impl VfsProber {
    pub fn new(enc: Arc<FfmpegAdapter>, fs: Arc<dyn Vfs>) -> Self {
        VfsProber { enc, fs }
    }
}

impl Prober for VfsProber {
    fn video_codec(&self, path: &Path) -> Result<String, ProbeError> {
        self.enc.video_codec(self.fs.as_ref(), path)
    }

    fn duration_seconds(&self, path: &Path) -> Result<f64, ProbeError> {
        self.enc.duration_seconds(self.fs.as_ref(), path)
    }

    fn comment(&self, path: &Path) -> Result<String, ProbeError> {
        self.enc.comment(self.fs.as_ref(), path)
    }
}

/// One hardware HEVC encoder recipe. `init_args` go before `-i`, the video
/// args replace the software codec block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwProfile {
    pub name: &'static str,
    pub init_args: &'static [&'static str],
    pub video_args: &'static [&'static str],
}

/// QP 18 is near-visually-lossless, appropriate for an intermediate that a
/// later pass re-encodes to AV1.
pub static HEVC_HW_PROFILES: &[HwProfile] = &[
    HwProfile {
        name: "hevc_nvenc",
        init_args: &[],
        video_args: &["-c:v", "hevc_nvenc", "-preset", "p4", "-cq", "18", "-b:v", "0"],
    },
    HwProfile {
        name: "hevc_qsv",
        init_args: &[],
        video_args: &["-c:v", "hevc_qsv", "-global_quality", "18"],
    },
    HwProfile {
        name: "hevc_vaapi",
        init_args: &["-vaapi_device", "/dev/dri/renderD128"],
        video_args: &["-vf", "format=nv12,hwupload", "-c:v", "hevc_vaapi", "-qp", "18"],
    },
    HwProfile {
        name: "hevc_amf",
        init_args: &[],
        video_args: &["-c:v", "hevc_amf", "-quality", "quality", "-qp_i", "18", "-qp_p", "18"],
    },
];

static AV1_HW_NAMES: &[&str] = &["av1_nvenc", "av1_vaapi", "av1_qsv", "av1_amf"];

/// What hardware encoding this machine supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwCaps {
    pub hevc_profile: Option<&'static HwProfile>,
    pub has_av1_hw: bool,
}

impl HwCaps {
    /// True when the worst codecs should get a fast hardware HEVC pass now,
    /// with the AV1 conversion left to a later scan.
    pub fn use_hevc_first(&self) -> bool {
        self.hevc_profile.is_some() && !self.has_av1_hw
    }
}

/// Options for the software AV1 encode.
#[derive(Debug, Clone)]
pub struct Av1Options {
    pub crf: u32,
    pub preset: u32,
    /// 0 leaves the thread count to ffmpeg.
    pub threads: usize,
    pub pix_fmt: String,
    pub container: String,
    /// Written to the container comment tag for identification.
    pub meta_comment: String,
    pub skip_if_already_av1: bool,
    /// `-sn` instead of `-c:s copy`; the fallback for incompatible subs.
    pub drop_subtitles: bool,
    pub extra_args: Vec<String>,
}

impl Default for Av1Options {
    fn default() -> Self {
        Av1Options {
            crf: 28,
            preset: 5,
            threads: 0,
            pix_fmt: "yuv420p10le".to_string(),
            container: "mkv".to_string(),
            meta_comment: String::new(),
            skip_if_already_av1: false,
            drop_subtitles: false,
            extra_args: Vec::new(),
        }
    }
}

fn container_muxer(container: &str) -> Option<&'static str> {
    match container.to_ascii_lowercase().as_str() {
        "mkv" => Some("matroska"),
        "webm" => Some("webm"),
        "mp4" => Some("mp4"),
        "mov" => Some("mov"),
        _ => None,
    }
}

/// Raw ffprobe JSON shapes; only the fields the probes read.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Output {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub tags: Option<Tags>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Tags {
        // Matroska stores the tag uppercase; ffprobe reports it as stored.
        #[serde(alias = "COMMENT", alias = "Comment")]
        pub comment: Option<String>,
    }
}

/// Wrapper around the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegAdapter {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for FfmpegAdapter {
    fn default() -> Self {
        FfmpegAdapter {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl FfmpegAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies both binaries answer a version probe.
    pub fn ensure_available(&self) -> Result<(), EncodeError> {
        for bin in [&self.ffmpeg, &self.ffprobe] {
            let status = std::process::Command::new(bin)
                .arg("-version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => {
                    return Err(EncodeError::ToolUnavailable {
                        tool: bin.clone(),
                        reason: format!("version probe exited with {s}"),
                    })
                }
                Err(e) => {
                    return Err(EncodeError::ToolUnavailable {
                        tool: bin.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn ffprobe_json(
        &self,
        fs: &dyn Vfs,
        extra: &[&str],
        path: &Path,
    ) -> Result<ffprobe_json::Output, ProbeError> {
        let mut args: Vec<OsString> = vec!["-v".into(), "error".into()];
        args.extend(extra.iter().map(OsString::from));
        args.push("-print_format".into());
        args.push("json".into());
        args.push(path.as_os_str().to_owned());

        let out = fs.exec(&self.ffprobe, &args)?;
        if !out.success() {
            return Err(ProbeError::Failed(out.stderr_utf8().trim().to_string()));
        }
        serde_json::from_slice(&out.stdout).map_err(|e| ProbeError::Parse(e.to_string()))
    }

    /// Codec name of the first video stream, e.g. `h264`, `hevc`, `av1`.
    pub fn video_codec(&self, fs: &dyn Vfs, path: &Path) -> Result<String, ProbeError> {
        let out = self.ffprobe_json(
            fs,
            &["-select_streams", "v:0", "-show_entries", "stream=codec_name"],
            path,
        )?;
        out.streams
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|s| s.codec_name)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(ProbeError::NoVideoStream)
    }

    /// Container duration in seconds.
    pub fn duration_seconds(&self, fs: &dyn Vfs, path: &Path) -> Result<f64, ProbeError> {
        let out = self.ffprobe_json(fs, &["-show_entries", "format=duration"], path)?;
        out.format
            .and_then(|f| f.duration)
            .and_then(|d| d.trim().parse::<f64>().ok())
            .ok_or(ProbeError::NoDuration)
    }

    /// Container-level comment tag; empty string when absent.
    pub fn comment(&self, fs: &dyn Vfs, path: &Path) -> Result<String, ProbeError> {
        let out = self.ffprobe_json(fs, &["-show_entries", "format_tags=comment"], path)?;
        Ok(out
            .format
            .and_then(|f| f.tags)
            .and_then(|t| t.comment)
            .map(|c| c.trim().to_string())
            .unwrap_or_default())
    }

    /// Parses the encoder list once per run to learn what hardware exists.
    pub fn detect_hw(&self) -> HwCaps {
        let out = std::process::Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output();
        let Ok(out) = out else {
            return HwCaps::default();
        };
        let list = String::from_utf8_lossy(&out.stdout);
        caps_from_encoder_list(&list)
    }

    /// Software AV1 encode to `output`, staged through a scratch sibling.
    #[allow(clippy::too_many_arguments)]
    pub async fn encode_to_av1_svt(
        &self,
        input: &Path,
        output: &Path,
        opt: &Av1Options,
        progress: Option<ProgressFn>,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<(), EncodeError> {
        if opt.skip_if_already_av1 {
            if let Ok(codec) = self.video_codec(&LocalFs, input) {
                if codec.eq_ignore_ascii_case("av1") {
                    return Err(EncodeError::AlreadyAv1);
                }
            }
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = paths::tmp_sibling(output, "av1");
        let _ = fs::remove_file(&tmp); // stale scratch from a previous crash

        let args = build_av1_args(input, &tmp, opt);
        if let Err(e) = self.run_streaming(args, progress, timeout, abort).await {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp, output) {
            let _ = fs::remove_file(&tmp);
            return Err(EncodeError::Io(e));
        }
        Ok(())
    }

    /// Fast hardware HEVC encode; the scanner picks the output up for AV1 on
    /// a later pass.
    #[allow(clippy::too_many_arguments)]
    pub async fn encode_to_hevc_hw(
        &self,
        input: &Path,
        output: &Path,
        profile: &HwProfile,
        comment: &str,
        drop_subtitles: bool,
        progress: Option<ProgressFn>,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<(), EncodeError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = paths::tmp_sibling(output, "hevc");
        let _ = fs::remove_file(&tmp);

        let args = build_hevc_args(input, &tmp, profile, comment, drop_subtitles);
        if let Err(e) = self.run_streaming(args, progress, timeout, abort).await {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp, output) {
            let _ = fs::remove_file(&tmp);
            return Err(EncodeError::Io(e));
        }
        Ok(())
    }

    /// Runs ffmpeg with stdin closed, stdout drained, and stderr streamed to
    /// the progress callback one line at a time. Both pipes are consumed to
    /// completion before the child is reaped.
    async fn run_streaming(
        &self,
        args: Vec<OsString>,
        progress: Option<ProgressFn>,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<(), EncodeError> {
        let mut cmd = proc::low_priority_command(&self.ffmpeg, &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;

        let drain = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut out, &mut tokio::io::sink()).await;
            })
        });

        let tail: Arc<Mutex<VecDeque<String>>> = Arc::default();
        let pump = child.stderr.take().map(|err| {
            let tail = tail.clone();
            tokio::spawn(pump_stderr(err, progress, tail))
        });

        enum Outcome {
            Exited(std::process::ExitStatus),
            WaitFailed(io::Error),
            TimedOut,
            Aborted,
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
            _ = abort.cancelled() => Outcome::Aborted,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(task) = drain {
            let _ = task.await;
        }
        if let Some(task) = pump {
            let _ = task.await;
        }

        match outcome {
            Outcome::Exited(status) if status.success() => Ok(()),
            Outcome::Exited(status) => {
                let detail = {
                    let tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    tail.iter().cloned().collect::<Vec<_>>().join(" | ")
                };
                Err(EncodeError::Failed {
                    status: status.code().unwrap_or(-1),
                    detail,
                })
            }
            Outcome::WaitFailed(e) => Err(EncodeError::Spawn(e)),
            Outcome::TimedOut => Err(EncodeError::TimedOut),
            Outcome::Aborted => Err(EncodeError::Aborted),
        }
    }
}

/// Picks hardware capabilities out of `ffmpeg -encoders` output: the first
/// HEVC profile in priority order wins.
fn caps_from_encoder_list(list: &str) -> HwCaps {
    HwCaps {
        hevc_profile: HEVC_HW_PROFILES
            .iter()
            .find(|profile| list.contains(profile.name)),
        has_av1_hw: AV1_HW_NAMES.iter().any(|name| list.contains(name)),
    }
}

fn build_av1_args(input: &Path, tmp_out: &Path, opt: &Av1Options) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
        "-map".into(),
        "0".into(),
        "-c:v".into(),
        "libsvtav1".into(),
        "-crf".into(),
        opt.crf.to_string().into(),
        "-preset".into(),
        opt.preset.to_string().into(),
        "-pix_fmt".into(),
        opt.pix_fmt.clone().into(),
        "-g".into(),
        "240".into(),
        "-c:a".into(),
        "copy".into(),
    ];

    if opt.drop_subtitles {
        args.push("-sn".into());
    } else {
        args.push("-c:s".into());
        args.push("copy".into());
    }

    args.push("-metadata".into());
    args.push(format!("comment={}", opt.meta_comment).into());

    if opt.threads > 0 {
        args.push("-threads".into());
        args.push(opt.threads.to_string().into());
    }

    if let Some(muxer) = container_muxer(&opt.container) {
        args.push("-f".into());
        args.push(muxer.into());
    }

    args.extend(opt.extra_args.iter().map(OsString::from));
    args.push(tmp_out.as_os_str().to_owned());
    args
}

fn build_hevc_args(
    input: &Path,
    tmp_out: &Path,
    profile: &HwProfile,
    comment: &str,
    drop_subtitles: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = profile.init_args.iter().map(OsString::from).collect();
    args.push("-hide_banner".into());
    args.push("-y".into());
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args.push("-map".into());
    args.push("0".into());
    args.extend(profile.video_args.iter().map(OsString::from));
    args.push("-c:a".into());
    args.push("copy".into());
    if drop_subtitles {
        args.push("-sn".into());
    } else {
        args.push("-c:s".into());
        args.push("copy".into());
    }
    if !comment.is_empty() {
        args.push("-metadata".into());
        args.push(format!("comment={comment}").into());
    }
    if let Some(muxer) = container_muxer("mkv") {
        args.push("-f".into());
        args.push(muxer.into());
    }
    args.push(tmp_out.as_os_str().to_owned());
    args
}

/// Streams stderr to the progress callback, splitting on both `\n` and the
/// `\r` ffmpeg uses for its in-place stats line, and keeps a short tail for
/// error reporting.
async fn pump_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    progress: Option<ProgressFn>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    const MAX_LINE: usize = 1024 * 1024;
    const TAIL_LINES: usize = 40;

    let mut reader = BufReader::with_capacity(64 * 1024, stderr);
    let mut line: Vec<u8> = Vec::new();

    let emit = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line).into_owned();
        if let Some(cb) = &progress {
            cb(&text);
        } else {
            debug!("ffmpeg: {text}");
        }
        let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(text);
        line.clear();
    };

    loop {
        let consumed = {
            let chunk = match reader.fill_buf().await {
                Ok([]) => break,
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            for &byte in chunk {
                if byte == b'\n' || byte == b'\r' {
                    emit(&mut line);
                } else if line.len() < MAX_LINE {
                    line.push(byte);
                }
            }
            chunk.len()
        };
        reader.consume(consumed);
    }
    emit(&mut line);
}
