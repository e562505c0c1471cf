//! CLI entry point for flicksqueeze.
//!
//! Parses flags, picks the local or SSH backend, wires OS signals to the
//! hard-abort token, and hands off to the daemon.

use clap::Parser;
use flicksqueeze::daemon;
use flicksqueeze::vfs::{dial_ssh, LocalFs, Vfs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Re-encode your movie library to AV1/HEVC, saving disk space while you
/// sleep.
#[derive(Parser, Debug)]
#[command(name = "flicksqueeze", disable_version_flag = true)]
struct Args {
    /// Keep originals (renamed with the _deleteMe suffix)
    #[arg(long)]
    no_delete: bool,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Movie folder or ssh://user@host/path
    root: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if args.version {
        println!("flicksqueeze {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let Some(root) = args.root.as_deref() else {
        print_help();
        return ExitCode::SUCCESS;
    };
    let root = root.trim().trim_matches(|c| c == '"' || c == '\'');
    eprintln!("flicksqueeze {}", env!("CARGO_PKG_VERSION"));

    let (fs, root_path): (Arc<dyn Vfs>, PathBuf) = if root.starts_with("ssh://") {
        match dial_ssh(root) {
            Ok((sftp, remote_root)) => (Arc::new(sftp), remote_root),
            Err(e) => {
                error!("ssh connect failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        match std::fs::metadata(root) {
            Ok(meta) if meta.is_dir() => (Arc::new(LocalFs), PathBuf::from(root)),
            _ => {
                error!("path {root:?} is not an accessible directory");
                return ExitCode::FAILURE;
            }
        }
    };

    if let Err(e) = ensure_ffmpeg_on_path() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let hard_abort = CancellationToken::new();
    spawn_signal_handler(hard_abort.clone());

    let cfg = daemon::Config {
        root: root_path,
        no_delete: args.no_delete,
    };
    match daemon::run(cfg, fs, hard_abort).await {
        Ok(()) => {
            tracing::info!("shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handler(hard_abort: CancellationToken) {
    tokio::spawn(async move {
        wait_for_abort_signal().await;
        warn!("abort signal received, cancelling current work");
        hard_abort.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_abort_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_abort_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Checks that ffmpeg and ffprobe are on PATH. On Windows, tries a winget
/// install when they are missing.
fn ensure_ffmpeg_on_path() -> Result<(), String> {
    let ffmpeg = which::which("ffmpeg");
    let ffprobe = which::which("ffprobe");
    if ffmpeg.is_ok() && ffprobe.is_ok() {
        return Ok(());
    }
    install_ffmpeg(ffmpeg.is_err())
}

#[cfg(windows)]
fn install_ffmpeg(_ffmpeg_missing: bool) -> Result<(), String> {
    tracing::info!("ffmpeg/ffprobe not on PATH; installing via winget (Gyan.FFmpeg)...");
    let status = std::process::Command::new("winget")
        .args([
            "install",
            "Gyan.FFmpeg",
            "--accept-package-agreements",
            "--accept-source-agreements",
        ])
        .status()
        .map_err(|e| format!("winget install Gyan.FFmpeg failed: {e}"))?;
    if !status.success() {
        return Err(
            "winget install Gyan.FFmpeg failed (install manually: winget install Gyan.FFmpeg)"
                .to_string(),
        );
    }
    if which::which("ffmpeg").is_ok() {
        return Ok(());
    }
    Err("ffmpeg was installed; run flicksqueeze again in a new terminal so PATH is updated"
        .to_string())
}

#[cfg(not(windows))]
fn install_ffmpeg(ffmpeg_missing: bool) -> Result<(), String> {
    if ffmpeg_missing {
        Err("ffmpeg not found on PATH".to_string())
    } else {
        Err("ffprobe not found on PATH".to_string())
    }
}

fn print_help() {
    println!("flicksqueeze {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Re-encode your movie library to AV1/HEVC,");
    println!("saving disk space while you sleep.");
    println!();
    println!("USAGE");
    println!("  flicksqueeze [flags] <movie-folder | ssh://user@host/path>");
    println!();
    println!("FLAGS");
    println!("  --no-delete   Keep originals (renamed with _deleteMe suffix)");
    println!("  --version     Print version and exit");
    println!();
    println!("EXAMPLES");
    println!("  flicksqueeze /path/to/movies");
    println!("  flicksqueeze --no-delete /path/to/movies");
    println!("  flicksqueeze ssh://username@homeserver/home/username/movies");
    println!();
    println!("INTERACTIVE");
    println!("  [Enter]       Show status while running");
    println!("  [q + Enter]   Quit after current encode finishes");
    println!("  [Ctrl+C]      Abort immediately");
    println!();
    println!("DEPENDENCIES");
    check_bin("ffmpeg");
    check_bin("ffprobe");
    println!();
}

/// One line of the dependency report: found (with version) or how to get
/// it on this platform.
fn check_bin(name: &str) {
    let path = match which::which(name) {
        Ok(path) => path,
        Err(_) => {
            println!("  ✗ {name:<12} NOT FOUND");
            if cfg!(target_os = "linux") {
                println!("    → sudo apt install {name}");
            } else if cfg!(target_os = "macos") {
                println!("    → brew install {name}");
            } else if cfg!(windows) {
                println!("    → winget install Gyan.FFmpeg");
            }
            return;
        }
    };
    match std::process::Command::new(&path).arg("-version").output() {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let first = stdout.lines().next().unwrap_or_default();
            println!("  ✓ {name:<12} {first}");
        }
        _ => println!("  ✓ {name:<12} {} (could not read version)", path.display()),
    }
}
