//! SSH/SFTP implementation of [`Vfs`].
//!
//! One `ssh2::Session` backs the whole run: SFTP traffic for file
//! operations, and a fresh exec channel per probe so ffprobe runs where the
//! files live. The ssh2 crate serializes libssh2 access internally, so the
//! backend is safe to share between the scanner and the converter tasks.

use super::{ExecOutput, FileMeta, Vfs, WalkControl};
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Error raised while establishing the SSH session.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid ssh URL: {0}")]
    InvalidUrl(String),

    #[error("tcp connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: io::Error,
    },

    #[error("ssh handshake failed: {0}")]
    Handshake(ssh2::Error),

    #[error("authentication failed for {user}@{host}: {source}")]
    Auth {
        user: String,
        host: String,
        source: ssh2::Error,
    },

    #[error("could not read password: {0}")]
    Prompt(io::Error),

    #[error("sftp subsystem failed: {0}")]
    Sftp(ssh2::Error),
}

/// Remote backend over one SSH session.
pub struct SftpFs {
    session: Session,
    sftp: Sftp,
}

/// Parses an `ssh://[user@]host[:port]/path` URL, connects, authenticates
/// (agent first, password prompt as fallback), and returns the backend plus
/// the remote root path.
///
/// Host keys are accepted without verification, matching the tool's
/// long-standing permissive posture; the connect log says so.
pub fn dial_ssh(raw_url: &str) -> Result<(SftpFs, PathBuf), DialError> {
    let url = Url::parse(raw_url).map_err(|e| DialError::InvalidUrl(e.to_string()))?;
    if url.scheme() != "ssh" {
        return Err(DialError::InvalidUrl(format!(
            "expected ssh:// scheme, got {:?}",
            url.scheme()
        )));
    }

    let mut user = url.username().to_string();
    if user.is_empty() {
        user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
    }
    let host = url
        .host_str()
        .ok_or_else(|| DialError::InvalidUrl("missing host".to_string()))?
        .to_string();
    let port = url.port().unwrap_or(22);
    let mut remote_path = percent_encoding::percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned();
    if remote_path.is_empty() {
        remote_path = "/".to_string();
    }

    let addr = format!("{host}:{port}");
    info!("connecting to {addr} as {user} (host key checking disabled)...");
    let stream = TcpStream::connect(&addr).map_err(|source| DialError::Connect {
        addr: addr.clone(),
        source,
    })?;

    let mut session = Session::new().map_err(DialError::Handshake)?;
    session.set_tcp_stream(stream);
    session.handshake().map_err(DialError::Handshake)?;

    if std::env::var_os("SSH_AUTH_SOCK").is_some() {
        if let Err(e) = session.userauth_agent(&user) {
            debug!("ssh agent auth failed, falling back to password: {e}");
        }
    }
    if !session.authenticated() {
        let password = rpassword::prompt_password(format!("Password for {user}@{host}: "))
            .map_err(DialError::Prompt)?;
        session
            .userauth_password(&user, &password)
            .map_err(|source| DialError::Auth {
                user: user.clone(),
                host: host.clone(),
                source,
            })?;
    }

    let sftp = session.sftp().map_err(DialError::Sftp)?;
    info!("connected to {addr}, root={remote_path}");
    Ok((SftpFs { session, sftp }, PathBuf::from(remote_path)))
}

fn io_err(e: ssh2::Error) -> io::Error {
    let kind = match e.code() {
        ErrorCode::SFTP(2) => io::ErrorKind::NotFound,
        ErrorCode::SFTP(3) => io::ErrorKind::PermissionDenied,
        ErrorCode::SFTP(11) => io::ErrorKind::AlreadyExists,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

fn exclusive_err(e: ssh2::Error) -> io::Error {
    // OpenSSH reports an O_EXCL collision as the generic FX_FAILURE (4);
    // servers speaking a newer protocol use FX_FILE_ALREADY_EXISTS (11).
    if matches!(e.code(), ErrorCode::SFTP(4) | ErrorCode::SFTP(11)) {
        return io::Error::new(io::ErrorKind::AlreadyExists, e);
    }
    io_err(e)
}

fn meta_from_stat(stat: &ssh2::FileStat) -> FileMeta {
    FileMeta {
        is_dir: stat.is_dir(),
        len: stat.size.unwrap_or(0),
        modified: SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime.unwrap_or(0)),
    }
}

impl SftpFs {
    /// Depth-first recursion; returns false once the visitor asked to stop.
    fn walk_dir(
        &self,
        dir: &Path,
        visit: &mut dyn FnMut(&Path, &FileMeta) -> WalkControl,
    ) -> bool {
        let mut entries = match self.sftp.readdir(dir) {
            Ok(entries) => entries,
            Err(_) => return true, // unreadable subtree, keep walking
        };
        entries.retain(|(path, _)| {
            path.file_name()
                .is_some_and(|name| name != "." && name != "..")
        });
        entries.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

        for (path, stat) in entries {
            let meta = meta_from_stat(&stat);
            match visit(&path, &meta) {
                WalkControl::Stop => return false,
                WalkControl::SkipSubtree => {}
                WalkControl::Continue => {
                    if meta.is_dir && !self.walk_dir(&path, visit) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl Vfs for SftpFs {
    fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&Path, &FileMeta) -> WalkControl,
    ) -> io::Result<()> {
        let meta = meta_from_stat(&self.sftp.stat(root).map_err(io_err)?);
        match visit(root, &meta) {
            WalkControl::Continue if meta.is_dir => {
                self.walk_dir(root, visit);
            }
            _ => {}
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<FileMeta> {
        self.sftp
            .stat(path)
            .map(|s| meta_from_stat(&s))
            .map_err(io_err)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.sftp.open(path).map_err(io_err)?))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.sftp.create(path).map_err(io_err)?))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = self
            .sftp
            .open_mode(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
                0o644,
                OpenType::File,
            )
            .map_err(io_err)?;
        Ok(Box::new(file))
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = self
            .sftp
            .open_mode(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                0o644,
                OpenType::File,
            )
            .map_err(exclusive_err)?;
        Ok(Box::new(file))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.sftp.unlink(path).map_err(io_err)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.sftp
            .rename(
                from,
                to,
                Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
            )
            .map_err(io_err)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        let mut prefix = PathBuf::new();
        for component in path.components() {
            prefix.push(component.as_os_str());
            if matches!(component, Component::RootDir | Component::Prefix(_)) {
                continue;
            }
            match self.sftp.stat(&prefix) {
                Ok(stat) if stat.is_dir() => continue,
                _ => {}
            }
            if let Err(e) = self.sftp.mkdir(&prefix, 0o755) {
                // A concurrent creator is fine; anything else is not.
                if self.sftp.stat(&prefix).is_err() {
                    return Err(io_err(e));
                }
            }
        }
        Ok(())
    }

    fn copy_to_local(&self, path: &Path, local: &Path) -> io::Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut src = self.sftp.open(path).map_err(io_err)?;
        let mut dst = fs::File::create(local)?;
        let size = io::copy(&mut src, &mut dst)?;
        info!("downloaded {} ({})", path.display(), human_bytes(size));
        Ok(())
    }

    fn copy_from_local(&self, local: &Path, path: &Path) -> io::Result<()> {
        let mut src = fs::File::open(local)?;
        let mut dst = self.sftp.create(path).map_err(io_err)?;
        let size = io::copy(&mut src, &mut dst)?;
        info!("uploaded {} ({})", path.display(), human_bytes(size));
        Ok(())
    }

    fn exec(&self, program: &str, args: &[OsString]) -> io::Result<ExecOutput> {
        let mut channel = self.session.channel_session().map_err(io_err)?;

        let mut cmdline = String::from(program);
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(&shell_quote(&arg.to_string_lossy()));
        }

        channel.exec(&cmdline).map_err(io_err)?;

        // Probe output is small, so sequential draining cannot stall the
        // channel window.
        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close().map_err(io_err)?;
        let status = channel.exit_status().map_err(io_err)?;
        Ok(ExecOutput {
            stdout,
            stderr,
            status,
        })
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Minimal POSIX single-quoting for remote command lines.
fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if !s.contains(|c: char| " \t\n\"'\\$`!#&|;(){}[]<>?*~".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn human_bytes(b: u64) -> String {
    const UNIT: u64 = 1024;
    if b < UNIT {
        return format!("{b} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", b as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_passthrough_and_escaping() {
        assert_eq!(shell_quote("ffprobe"), "ffprobe");
        assert_eq!(shell_quote("/plain/path.mkv"), "/plain/path.mkv");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn dial_rejects_non_ssh_urls() {
        assert!(matches!(
            dial_ssh("http://host/path"),
            Err(DialError::InvalidUrl(_))
        ));
        assert!(matches!(dial_ssh("not a url"), Err(DialError::InvalidUrl(_))));
    }
}
