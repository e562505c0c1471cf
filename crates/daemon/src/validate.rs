//! Sanity check on transcoded output before the original is retired.
//!
//! Probes go through the caller's [`Prober`], so a remote output is checked
//! where it lives. Nothing is deleted here; the orchestrator decides what to
//! do with a failing output.

use crate::ffmpeg::{ProbeError, Prober};
use crate::paths::MIN_SIZE;
use crate::vfs::Vfs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Input and output durations may differ by at most this many seconds.
pub const MAX_DURATION_DRIFT_SECS: f64 = 5.0;

/// A reason the output is unacceptable.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("cannot stat output: {0}")]
    StatOutput(io::Error),

    #[error("output ({output} bytes) is not smaller than input ({input} bytes)")]
    NotSmaller { output: u64, input: u64 },

    #[error("output too small ({output} bytes), likely corrupt")]
    TooSmall { output: u64 },

    #[error("cannot probe input duration: {0}")]
    ProbeInput(ProbeError),

    #[error("cannot probe output duration: {0}")]
    ProbeOutput(ProbeError),

    #[error("duration mismatch: input {input:.1}s vs output {output:.1}s")]
    DurationMismatch { input: f64, output: f64 },
}

/// Checks that `output` is an acceptable replacement for `input`:
/// strictly smaller, at least [`MIN_SIZE`] bytes, and within
/// [`MAX_DURATION_DRIFT_SECS`] of the input's duration.
pub fn validate(
    fs: &dyn Vfs,
    prober: &dyn Prober,
    input: &Path,
    output: &Path,
    input_size: u64,
) -> Result<(), ValidateError> {
    let out_meta = fs.stat(output).map_err(ValidateError::StatOutput)?;
    let out_size = out_meta.len;

    if out_size >= input_size {
        return Err(ValidateError::NotSmaller {
            output: out_size,
            input: input_size,
        });
    }
    if out_size < MIN_SIZE {
        return Err(ValidateError::TooSmall { output: out_size });
    }

    let in_dur = prober
        .duration_seconds(input)
        .map_err(ValidateError::ProbeInput)?;
    let out_dur = prober
        .duration_seconds(output)
        .map_err(ValidateError::ProbeOutput)?;

    if (in_dur - out_dur).abs() > MAX_DURATION_DRIFT_SECS {
        return Err(ValidateError::DurationMismatch {
            input: in_dur,
            output: out_dur,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProber;
    use crate::vfs::LocalFs;
    use std::fs;
    use tempfile::TempDir;

    fn write_sized(path: &Path, len: usize) {
        fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn accepts_smaller_output_with_matching_duration() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("out.mkv");
        write_sized(&output, MIN_SIZE as usize);

        let prober = FakeProber::new()
            .with_duration(&input, 3600.0)
            .with_duration(&output, 3597.5);

        validate(&LocalFs, &prober, &input, &output, MIN_SIZE * 3).unwrap();
    }

    #[test]
    fn rejects_output_not_smaller() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("out.mkv");
        write_sized(&output, 1000);

        let prober = FakeProber::new();
        let err = validate(&LocalFs, &prober, &input, &output, 1000).unwrap_err();
        assert!(matches!(err, ValidateError::NotSmaller { .. }));
    }

    #[test]
    fn rejects_output_below_min_size() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("out.mkv");
        write_sized(&output, (MIN_SIZE - 1) as usize);

        let prober = FakeProber::new();
        let err = validate(&LocalFs, &prober, &input, &output, MIN_SIZE * 10).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::TooSmall {
                output
            } if output == MIN_SIZE - 1
        ));
    }

    #[test]
    fn rejects_duration_drift_beyond_limit() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("out.mkv");
        write_sized(&output, MIN_SIZE as usize);

        let prober = FakeProber::new()
            .with_duration(&input, 3600.0)
            .with_duration(&output, 3594.9);

        let err = validate(&LocalFs, &prober, &input, &output, MIN_SIZE * 3).unwrap_err();
        assert!(matches!(err, ValidateError::DurationMismatch { .. }));
    }

    #[test]
    fn accepts_drift_at_exactly_the_limit() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("out.mkv");
        write_sized(&output, MIN_SIZE as usize);

        let prober = FakeProber::new()
            .with_duration(&input, 100.0)
            .with_duration(&output, 95.0);

        validate(&LocalFs, &prober, &input, &output, MIN_SIZE * 3).unwrap();
    }

    #[test]
    fn missing_output_is_a_stat_error() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.mkv");
        let output = tmp.path().join("never-written.mkv");

        let prober = FakeProber::new();
        let err = validate(&LocalFs, &prober, &input, &output, MIN_SIZE * 3).unwrap_err();
        assert!(matches!(err, ValidateError::StatOutput(_)));
    }
}
