//! Direct-OS implementation of [`Vfs`].

use super::{ExecOutput, FileMeta, Vfs, WalkControl};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Command;
use std::time::SystemTime;
use walkdir::WalkDir;

/// Local filesystem backend. Zero-sized; clone freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn meta_from_std(meta: &fs::Metadata) -> FileMeta {
    FileMeta {
        is_dir: meta.is_dir(),
        len: meta.len(),
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

impl Vfs for LocalFs {
    fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&Path, &FileMeta) -> WalkControl,
    ) -> io::Result<()> {
        // sort_by_file_name gives each directory's entries in byte order,
        // which combined with depth-first traversal equals path_key order.
        let mut it = WalkDir::new(root).sort_by_file_name().into_iter();
        loop {
            let entry = match it.next() {
                None => break,
                Some(Err(_)) => continue,
                Some(Ok(entry)) => entry,
            };
            let meta = match entry.metadata() {
                Ok(m) => meta_from_std(&m),
                Err(_) => continue,
            };
            match visit(entry.path(), &meta) {
                WalkControl::Continue => {}
                WalkControl::SkipSubtree => {
                    if meta.is_dir {
                        it.skip_current_dir();
                    }
                }
                WalkControl::Stop => break,
            }
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<FileMeta> {
        fs::metadata(path).map(|m| meta_from_std(&m))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(path)?))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(
            OpenOptions::new().append(true).create(true).open(path)?,
        ))
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(
            OpenOptions::new().write(true).create_new(true).open(path)?,
        ))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn copy_to_local(&self, path: &Path, local: &Path) -> io::Result<()> {
        if path == local {
            return Ok(());
        }
        fs::copy(path, local).map(|_| ())
    }

    fn copy_from_local(&self, local: &Path, path: &Path) -> io::Result<()> {
        if local == path {
            return Ok(());
        }
        fs::copy(local, path).map(|_| ())
    }

    fn exec(&self, program: &str, args: &[OsString]) -> io::Result<ExecOutput> {
        let out = Command::new(program).args(args).output()?;
        Ok(ExecOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            status: out.status.code().unwrap_or(-1),
        })
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn walk_visits_in_path_key_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        // Deliberately interleave a directory ("b") with files whose names
        // extend it ("b.mkv") to exercise the subtree-before-sibling order.
        fs::create_dir(root.join("b")).unwrap();
        touch(&root.join("b").join("inner.mkv"));
        touch(&root.join("a.mkv"));
        touch(&root.join("b.mkv"));

        let mut seen = Vec::new();
        LocalFs
            .walk(root, &mut |path, meta| {
                if !meta.is_dir {
                    seen.push(path.to_string_lossy().into_owned());
                }
                WalkControl::Continue
            })
            .unwrap();

        let keys: Vec<String> = seen.iter().map(|p| crate::paths::path_key(p)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "walk order must equal path_key order: {seen:?}");
        assert!(seen[0].ends_with("a.mkv"));
        assert!(seen[1].ends_with("inner.mkv"));
        assert!(seen[2].ends_with("b.mkv"));
    }

    #[test]
    fn walk_skip_subtree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("skipme")).unwrap();
        touch(&root.join("skipme").join("hidden.mkv"));
        touch(&root.join("kept.mkv"));

        let mut files = Vec::new();
        LocalFs
            .walk(root, &mut |path, meta| {
                if meta.is_dir && path.file_name().is_some_and(|n| n == "skipme") {
                    return WalkControl::SkipSubtree;
                }
                if !meta.is_dir {
                    files.push(path.to_path_buf());
                }
                WalkControl::Continue
            })
            .unwrap();

        assert_eq!(files, vec![root.join("kept.mkv")]);
    }

    #[test]
    fn walk_stop_aborts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("a.mkv"));
        touch(&root.join("b.mkv"));

        let mut count = 0;
        LocalFs
            .walk(root, &mut |_, meta| {
                if meta.is_dir {
                    return WalkControl::Continue;
                }
                count += 1;
                WalkControl::Stop
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn create_exclusive_fails_on_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lock");
        let mut first = LocalFs.create_exclusive(&path).unwrap();
        first.write_all(b"host now\n").unwrap();
        drop(first);

        let err = LocalFs.create_exclusive(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn open_append_accumulates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tally.log");
        for line in ["one\n", "two\n"] {
            let mut w = LocalFs.open_append(&path).unwrap();
            w.write_all(line.as_bytes()).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn copy_roundtrip_and_self_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, b"payload").unwrap();

        LocalFs.copy_to_local(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        // Copying a path onto itself is a no-op, not a truncation.
        LocalFs.copy_to_local(&src, &src).unwrap();
        assert_eq!(fs::read(&src).unwrap(), b"payload");
    }
}
