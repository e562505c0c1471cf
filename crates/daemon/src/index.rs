//! Append-only, sorted, streaming codec index with two-generation rotation.
//!
//! Each scan reads the previous generation through a one-entry cursor while
//! writing the next generation, merge-joined against the directory walk.
//! Rotation never deletes the only good copy: at scan start the larger of
//! the two on-disk files becomes the reader source, on the grounds that the
//! bigger file is the more complete one, and the staging copy is only
//! removed after a clean, uninterrupted scan.

use crate::paths::{self, path_key};
use crate::vfs::Vfs;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const INDEX_VERSION: u32 = 1;
const INDEX_HEADER: &str = "# flicksqueeze codec index – do not edit | version:";

/// Codec tag for a file whose probe failed; retried only when size or mtime
/// change.
pub const CODEC_PROBE_FAILED: &str = "X";

/// Codec tag for a final AV1 output produced by this tool; never
/// re-processed.
pub const CODEC_OURS: &str = "flicksqueeze";

/// Index file name for this host: `.flicksqueeze-<hostname>.idx`.
pub fn index_file() -> String {
    format!(".flicksqueeze-{}.idx", paths::hostname())
}

/// Previous-generation staging name: `.flicksqueeze-<hostname>.idx.tmp`.
pub fn index_tmp() -> String {
    format!(".flicksqueeze-{}.idx.tmp", paths::hostname())
}

/// One persisted index line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub codec: String,
    pub mod_unix: i64,
    pub size: u64,
    pub path: String,
}

fn parse_entry(line: &str) -> Option<IndexEntry> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.splitn(4, '\t');
    let codec = fields.next()?;
    let mod_unix: i64 = fields.next()?.parse().ok()?;
    let size: u64 = fields.next()?.parse().ok()?;
    let path = fields.next()?;
    Some(IndexEntry {
        codec: codec.to_string(),
        mod_unix,
        size,
        path: path.to_string(),
    })
}

/// Streaming cursor over the previous-generation index.
///
/// Holds at most one entry in memory. Construction failures (missing file,
/// bad header, wrong version) degrade to an empty reader, which behaves
/// exactly like a first-ever scan.
pub struct IndexReader {
    lines: Option<io::Lines<BufReader<Box<dyn Read + Send>>>>,
    cur: Option<IndexEntry>,
}

impl IndexReader {
    /// Opens the reader, returning an empty cursor unless the file exists
    /// and carries a matching header.
    pub fn open(fs: &dyn Vfs, path: &Path) -> IndexReader {
        let empty = IndexReader {
            lines: None,
            cur: None,
        };
        let Ok(raw) = fs.open(path) else {
            return empty;
        };
        let mut lines = BufReader::new(raw).lines();

        let Some(Ok(header)) = lines.next() else {
            return empty;
        };
        let Some((_, version)) = header.split_once("version:") else {
            return empty;
        };
        if version.trim().parse::<u32>() != Ok(INDEX_VERSION) {
            return empty;
        }

        let mut reader = IndexReader {
            lines: Some(lines),
            cur: None,
        };
        reader.next_entry();
        reader
    }

    /// Constructs a reader over no entries. Used by tests and by scans of a
    /// never-indexed root.
    pub fn empty() -> IndexReader {
        IndexReader {
            lines: None,
            cur: None,
        }
    }

    fn next_entry(&mut self) {
        self.cur = None;
        let Some(lines) = self.lines.as_mut() else {
            return;
        };
        for line in lines {
            let Ok(line) = line else {
                return;
            };
            if let Some(entry) = parse_entry(&line) {
                self.cur = Some(entry);
                return;
            }
            // blank, comment, or malformed: tolerated and skipped
        }
    }

    /// Advances the cursor to `path` (which callers must present in
    /// non-decreasing [`path_key`] order) and reports a cache hit when the
    /// stored size and whole-second mtime still match.
    ///
    /// The cursor moves past the matching entry whether or not it hits, so
    /// it stays in lockstep with the walk.
    pub fn advance_to(&mut self, path: &str, mod_unix: i64, size: u64) -> Option<String> {
        let key = path_key(path);
        while let Some(cur) = &self.cur {
            if path_key(&cur.path) >= key {
                break;
            }
            self.next_entry();
        }

        if self.cur.as_ref().map(|c| c.path.as_str()) != Some(path) {
            return None;
        }
        let Some(entry) = self.cur.take() else {
            return None;
        };
        self.next_entry();
        if entry.size == size && entry.mod_unix == mod_unix {
            Some(entry.codec)
        } else {
            None
        }
    }
}

/// Buffered writer for the next-generation index.
pub struct IndexWriter {
    w: BufWriter<Box<dyn Write + Send>>,
    written: usize,
}

impl IndexWriter {
    /// Creates (truncating) the index at `path` and writes the header.
    pub fn create(fs: &dyn Vfs, path: &Path) -> io::Result<IndexWriter> {
        let raw = fs.create(path)?;
        let mut w = BufWriter::new(raw);
        writeln!(w, "{INDEX_HEADER} {INDEX_VERSION}")?;
        Ok(IndexWriter { w, written: 0 })
    }

    pub fn write(&mut self, path: &str, codec: &str, mod_unix: i64, size: u64) -> io::Result<()> {
        writeln!(self.w, "{codec}\t{mod_unix}\t{size}\t{path}")?;
        self.written += 1;
        Ok(())
    }

    /// Flushes and closes, returning the number of entries written.
    pub fn finish(mut self) -> io::Result<usize> {
        self.w.flush()?;
        Ok(self.written)
    }
}

/// Picks the reader source and writer target for a scan.
///
/// The larger of the current and staging files wins the reader role (renamed
/// to the staging name if needed) and the smaller is removed, so a crash
/// mid-write can never cost the last complete generation. Returns
/// `(reader_path, writer_path)`.
pub fn prepare(fs: &dyn Vfs, root: &Path) -> (PathBuf, PathBuf) {
    let new_path = root.join(index_file());
    let tmp_path = root.join(index_tmp());

    let base = fs.stat(&new_path);
    let tmp = fs.stat(&tmp_path);

    match (base, tmp) {
        (Err(_), _) => {} // nothing current; whatever staging holds is the reader
        (Ok(_), Err(_)) => {
            let _ = fs.rename(&new_path, &tmp_path);
        }
        (Ok(base), Ok(tmp)) => {
            if base.len >= tmp.len {
                let _ = fs.remove(&tmp_path);
                let _ = fs.rename(&new_path, &tmp_path);
            } else {
                let _ = fs.remove(&new_path);
            }
        }
    }

    (tmp_path, new_path)
}

/// Retires the staging file after a clean scan.
pub fn finish(fs: &dyn Vfs, tmp_path: &Path, written: usize) {
    let _ = fs.remove(tmp_path);
    info!("index: saved {written} entries");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::LocalFs;
    use std::fs;
    use tempfile::TempDir;

    fn write_index(path: &Path, entries: &[(&str, i64, u64, &str)]) {
        let mut body = format!("{INDEX_HEADER} {INDEX_VERSION}\n");
        for (codec, mod_unix, size, p) in entries {
            body.push_str(&format!("{codec}\t{mod_unix}\t{size}\t{p}\n"));
        }
        fs::write(path, body).unwrap();
    }

    #[test]
    fn roundtrip_preserves_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        let entries = [
            ("h264", 1_700_000_000_i64, 1_000_000_u64, "a/movie.mkv"),
            ("hevc", 1_700_000_100, 2_000_000, "b/show.mp4"),
            ("X", 1_700_000_200, 3_000_000, "c/odd.avi"),
        ];

        let mut w = IndexWriter::create(&LocalFs, &path).unwrap();
        for (codec, mod_unix, size, p) in entries {
            w.write(p, codec, mod_unix, size).unwrap();
        }
        assert_eq!(w.finish().unwrap(), 3);

        let mut r = IndexReader::open(&LocalFs, &path);
        for (codec, mod_unix, size, p) in entries {
            assert_eq!(r.advance_to(p, mod_unix, size).as_deref(), Some(codec));
        }
        assert_eq!(r.advance_to("z/later.mkv", 0, 0), None);
    }

    #[test]
    fn miss_on_changed_size_or_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        write_index(&path, &[("h264", 100, 500, "movie.mkv")]);

        let mut r = IndexReader::open(&LocalFs, &path);
        assert_eq!(r.advance_to("movie.mkv", 100, 501), None);

        let mut r = IndexReader::open(&LocalFs, &path);
        assert_eq!(r.advance_to("movie.mkv", 101, 500), None);
    }

    #[test]
    fn cursor_advances_past_entry_on_miss() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        write_index(
            &path,
            &[("h264", 100, 500, "a.mkv"), ("hevc", 200, 600, "b.mkv")],
        );

        let mut r = IndexReader::open(&LocalFs, &path);
        // Size mismatch on a.mkv must still consume the entry so b.mkv is
        // next in line.
        assert_eq!(r.advance_to("a.mkv", 100, 999), None);
        assert_eq!(r.advance_to("b.mkv", 200, 600).as_deref(), Some("hevc"));
    }

    #[test]
    fn skips_entries_for_paths_not_walked() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        write_index(
            &path,
            &[
                ("h264", 1, 10, "a.mkv"),
                ("vp9", 2, 20, "b.mkv"),
                ("hevc", 3, 30, "c.mkv"),
            ],
        );

        let mut r = IndexReader::open(&LocalFs, &path);
        // b.mkv was deleted between scans; the cursor hops over it.
        assert_eq!(r.advance_to("a.mkv", 1, 10).as_deref(), Some("h264"));
        assert_eq!(r.advance_to("c.mkv", 3, 30).as_deref(), Some("hevc"));
    }

    #[test]
    fn tolerates_blank_comment_and_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        let body = format!(
            "{INDEX_HEADER} {INDEX_VERSION}\n\
             \n\
             # a comment\n\
             not-enough-fields\n\
             h264\tnotanumber\t10\tbad.mkv\n\
             h264\t100\t500\tgood.mkv\n"
        );
        fs::write(&path, body).unwrap();

        let mut r = IndexReader::open(&LocalFs, &path);
        assert_eq!(r.advance_to("good.mkv", 100, 500).as_deref(), Some("h264"));
    }

    #[test]
    fn empty_or_missing_index_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.idx");
        let mut r = IndexReader::open(&LocalFs, &missing);
        assert_eq!(r.advance_to("a.mkv", 0, 0), None);

        // A 0-byte index behaves identically to no index at all.
        let zero = tmp.path().join("zero.idx");
        fs::write(&zero, b"").unwrap();
        let mut r = IndexReader::open(&LocalFs, &zero);
        assert_eq!(r.advance_to("a.mkv", 0, 0), None);
    }

    #[test]
    fn wrong_version_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        fs::write(
            &path,
            format!("{INDEX_HEADER} 2\nh264\t100\t500\ta.mkv\n"),
        )
        .unwrap();
        let mut r = IndexReader::open(&LocalFs, &path);
        assert_eq!(r.advance_to("a.mkv", 100, 500), None);
    }

    #[test]
    fn prepare_keeps_the_larger_generation() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let new_path = root.join(index_file());
        let tmp_path = root.join(index_tmp());

        // Current generation is bigger: it should become the reader source.
        fs::write(&new_path, b"bigger current generation content").unwrap();
        fs::write(&tmp_path, b"small").unwrap();

        let (reader, writer) = prepare(&LocalFs, root);
        assert_eq!(reader, tmp_path);
        assert_eq!(writer, new_path);
        assert_eq!(
            fs::read(&tmp_path).unwrap(),
            b"bigger current generation content"
        );
        assert!(!new_path.exists());
    }

    #[test]
    fn prepare_keeps_larger_staging_in_place() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let new_path = root.join(index_file());
        let tmp_path = root.join(index_tmp());

        // Staging (previous generation) is bigger: the truncated current
        // file is the crash victim and is discarded.
        fs::write(&new_path, b"tiny").unwrap();
        fs::write(&tmp_path, b"previous generation, far more complete").unwrap();

        let (reader, _) = prepare(&LocalFs, root);
        assert_eq!(reader, tmp_path);
        assert_eq!(
            fs::read(&tmp_path).unwrap(),
            b"previous generation, far more complete"
        );
        assert!(!new_path.exists());
    }

    #[test]
    fn prepare_with_single_or_no_generation() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let new_path = root.join(index_file());
        let tmp_path = root.join(index_tmp());

        // Neither exists: reader will simply be empty.
        let (reader, writer) = prepare(&LocalFs, root);
        assert_eq!(reader, tmp_path);
        assert_eq!(writer, new_path);

        // Only the current generation exists: it is rotated to staging.
        fs::write(&new_path, b"only copy").unwrap();
        let (reader, _) = prepare(&LocalFs, root);
        assert_eq!(reader, tmp_path);
        assert_eq!(fs::read(&tmp_path).unwrap(), b"only copy");
    }

    #[test]
    fn finish_removes_staging() {
        let tmp = TempDir::new().unwrap();
        let tmp_path = tmp.path().join(index_tmp());
        fs::write(&tmp_path, b"previous").unwrap();
        finish(&LocalFs, &tmp_path, 3);
        assert!(!tmp_path.exists());
    }
}
