//! Per-host child-process decoration.
//!
//! The encoder must be able to run for days without anyone noticing, so the
//! child gets the lowest scheduling and IO priorities the platform offers,
//! and on Linux a parent-death signal so an abandoned ffmpeg never outlives
//! a crashed daemon.

use std::ffi::OsString;
use tokio::process::Command;

/// Builds a command for `bin args...` decorated with the platform's
/// lowest-priority settings.
pub fn low_priority_command(bin: &str, args: &[OsString]) -> Command {
    build(bin, args)
}

#[cfg(target_os = "linux")]
fn build(bin: &str, args: &[OsString]) -> Command {
    let mut cmd = if which_on_path("nice") {
        let mut cmd = Command::new("nice");
        cmd.args(["-n", "19", "ionice", "-c", "3", bin]);
        cmd.args(args);
        cmd
    } else {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        cmd
    };
    // SIGTERM the child if this process dies; pre_exec runs post-fork.
    unsafe {
        cmd.pre_exec(|| {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            Ok(())
        });
    }
    cmd
}

#[cfg(target_os = "macos")]
fn build(bin: &str, args: &[OsString]) -> Command {
    if which_on_path("nice") {
        let mut cmd = Command::new("nice");
        cmd.args(["-n", "19", bin]);
        cmd.args(args);
        cmd
    } else {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        cmd
    }
}

#[cfg(windows)]
fn build(bin: &str, args: &[OsString]) -> Command {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const IDLE_PRIORITY_CLASS: u32 = 0x0000_0040;

    let mut cmd = Command::new(bin);
    cmd.args(args);
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | IDLE_PRIORITY_CLASS);
    cmd
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn build(bin: &str, args: &[OsString]) -> Command {
    let mut cmd = Command::new(bin);
    cmd.args(args);
    cmd
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn which_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_carries_program_args() {
        let args: Vec<OsString> = vec!["-hide_banner".into(), "-version".into()];
        let cmd = low_priority_command("ffmpeg", &args);
        let std_cmd = cmd.as_std();
        let all: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        // Either decorated (nice ... ffmpeg -hide_banner -version) or bare,
        // depending on what PATH offers; the tail is stable either way.
        assert!(all.ends_with(&["-hide_banner".to_string(), "-version".to_string()]));
    }
}
