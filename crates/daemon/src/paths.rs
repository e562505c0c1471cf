//! Path policy: filename classification, output/lock/temp path derivation,
//! and the tunable constants shared by the scanner and the converter.
//!
//! Everything here is a pure function over file names; nothing touches the
//! filesystem except the once-per-process hostname lookup.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Files below this size are never worth converting.
pub const MIN_SIZE: u64 = 10 * 1024 * 1024;

/// Extension of every transcoded output.
pub const OUTPUT_EXT: &str = ".mkv";

/// Infix marking an in-place re-encode of a file that is already `.mkv`,
/// so the encode never clobbers its own source. Stripped on final rename.
pub const AV1_TMP_TAG: &str = ".av1tmp";

/// Suffix appended to retired originals when running with `--no-delete`.
pub const DELETE_ME_TAG: &str = "_deleteMe";

/// Prefix shared by every scratch artifact an encoder invocation creates.
pub const TMP_PREFIX: &str = ".tmp-";

/// Suffix of the per-input lock file.
pub const LOCK_SUFFIX: &str = ".flsq-lock";

/// Container comment written into final AV1 outputs.
pub const META_COMMENT: &str = "converted to av1 with flicksqueeze";

/// Container comment written into HEVC intermediates that a later scan
/// should pick up again for AV1.
pub const HEVC_META_COMMENT: &str = "hevc pass by flicksqueeze - av1 pending";

/// Tab-separated conversion tally, appended in the scanned root.
pub const TALLY_FILE: &str = ".flicksqueeze.log";

/// Computes the output path for an input file.
///
/// A non-`.mkv` input maps to the same stem with a `.mkv` extension. An
/// `.mkv` input maps to the `.av1tmp.mkv` form so the encode does not write
/// over its own source; a path already carrying the tag maps to itself.
pub fn output_path(input: &Path) -> PathBuf {
    let is_mkv = input
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("mkv"));
    if !is_mkv {
        return input.with_extension("mkv");
    }

    let stem = input.file_stem().unwrap_or_default();
    if stem.to_string_lossy().ends_with(AV1_TMP_TAG) {
        return input.to_path_buf();
    }

    let mut name = stem.to_os_string();
    name.push(AV1_TMP_TAG);
    name.push(OUTPUT_EXT);
    input.with_file_name(name)
}

/// True when a basename is one of our intermediate artifacts and must be
/// ignored by the scanner.
pub fn is_work_file(basename: &str) -> bool {
    basename.contains(AV1_TMP_TAG)
        || basename.contains(TMP_PREFIX)
        || basename.contains(DELETE_ME_TAG)
}

/// True when a container comment identifies one of this tool's outputs,
/// final or intermediate.
pub fn is_our_comment(comment: &str) -> bool {
    comment == META_COMMENT || comment == HEVC_META_COMMENT
}

/// Lock file path for an input: `<input>.flsq-lock` (suffix appended to the
/// full name, extension included).
pub fn lock_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Scratch sibling for an encode or upload:
/// `<out-stem>.tmp-flsq-<kind>-<host><out-ext>`.
pub fn tmp_sibling(output: &Path, kind: &str) -> PathBuf {
    let stem = output.file_stem().unwrap_or_default();
    let mut name: OsString = stem.to_os_string();
    name.push(format!("{}flsq-{}-{}", TMP_PREFIX, kind, hostname()));
    if let Some(ext) = output.extension() {
        name.push(".");
        name.push(ext);
    }
    output.with_file_name(name)
}

/// Retired-original path under `--no-delete`: the stem gains `_deleteMe`
/// ahead of the extension, which also makes [`is_work_file`] true.
pub fn delete_me_path(input: &Path) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(DELETE_ME_TAG);
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    input.with_file_name(name)
}

/// Sort key that makes a depth-first directory walk compare equal to a flat
/// sort: the separator is replaced with a byte that orders before anything a
/// filename may contain, so a directory's subtree sorts directly after the
/// directory itself.
pub fn path_key(path: &str) -> String {
    path.replace(std::path::MAIN_SEPARATOR, "\0")
}

static HOSTNAME: OnceLock<String> = OnceLock::new();

/// This machine's hostname, looked up once per process. Falls back to
/// `unknown` when the OS cannot provide one.
pub fn hostname() -> &'static str {
    HOSTNAME.get_or_init(|| {
        let h = gethostname::gethostname().to_string_lossy().into_owned();
        if h.is_empty() {
            "unknown".to_string()
        } else {
            h
        }
    })
}
