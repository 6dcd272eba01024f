// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The muxer driver (C5): wraps an external muxer binary as a child
//! process, the way the rest of this crate wraps I/O — probe first with a
//! trivial invocation, then run the real job and surface a captured
//! stderr tail on failure.

use crate::error::MuxerError;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Clone, Debug)]
pub struct MuxOptions {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
    pub copy_streams: bool,
    pub faststart: bool,
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub struct Probe {
    pub duration_seconds: f64,
}

pub struct MuxerDriver {
    binary: PathBuf,
    availability: tokio::sync::OnceCell<()>,
}

impl MuxerDriver {
    pub fn new(binary: PathBuf) -> Self {
        MuxerDriver {
            binary,
            availability: tokio::sync::OnceCell::new(),
        }
    }

    /// Checks the binary is discoverable and runnable via a trivial
    /// `-version` invocation.
    pub async fn check_available(&self) -> Result<(), MuxerError> {
        Command::new(&self.binary)
            .arg("-version")
            .output()
            .await
            .map_err(|_| MuxerError::MuxerNotFound)?;
        Ok(())
    }

    /// Runs [`Self::check_available`] at most once per process: a
    /// successful probe is cached for the process lifetime, a failed one
    /// is retried on the next call (the operator may fix `PATH`/the
    /// binary without restarting).
    pub async fn ensure_available(&self) -> Result<(), MuxerError> {
        self.availability
            .get_or_try_init(|| self.check_available())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, opts), fields(output = %opts.output_path.display()))]
    pub async fn mux(&self, opts: &MuxOptions) -> Result<(PathBuf, Probe), MuxerError> {
        self.ensure_available().await?;
        if !opts.video_path.is_file() {
            return Err(MuxerError::InputNotFound(opts.video_path.display().to_string()));
        }
        if !opts.audio_path.is_file() {
            return Err(MuxerError::InputNotFound(opts.audio_path.display().to_string()));
        }

        let mut cmd = Command::new(&self.binary);
        if opts.overwrite {
            cmd.arg("-y");
        } else {
            cmd.arg("-n");
        }
        cmd.arg("-i").arg(&opts.video_path);
        cmd.arg("-i").arg(&opts.audio_path);
        cmd.args(["-map", "0:v:0", "-map", "1:a:0"]);
        if opts.copy_streams {
            cmd.args(["-c", "copy"]);
        }
        if opts.faststart {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.arg(&opts.output_path);

        let output = cmd
            .output()
            .await
            .map_err(|e| MuxerError::ProcessError {
                exit_code: None,
                stderr_tail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(MuxerError::ProcessError {
                exit_code: output.status.code(),
                stderr_tail: tail(&output.stderr, STDERR_TAIL_BYTES),
            });
        }

        let probe = self.probe(&opts.output_path).await?;
        Ok((opts.output_path.clone(), probe))
    }

    /// Same as [`Self::mux`] for a single combined format input: no
    /// muxing is actually needed, just a rename/ensure at `output_path`.
    pub async fn convert(&self, input: &Path, output_path: &Path) -> Result<(PathBuf, Probe), MuxerError> {
        self.ensure_available().await?;
        if !input.is_file() {
            return Err(MuxerError::InputNotFound(input.display().to_string()));
        }
        if input != output_path {
            tokio::fs::rename(input, output_path)
                .await
                .map_err(|e| MuxerError::ProcessError {
                    exit_code: None,
                    stderr_tail: e.to_string(),
                })?;
        }
        let probe = self.probe(output_path).await?;
        Ok((output_path.to_path_buf(), probe))
    }

    async fn probe(&self, path: &Path) -> Result<Probe, MuxerError> {
        let output = Command::new(&self.binary)
            .args(["-i"])
            .arg(path)
            .output()
            .await
            .map_err(|e| MuxerError::ProcessError {
                exit_code: None,
                stderr_tail: e.to_string(),
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let duration_seconds = parse_duration(&stderr).unwrap_or(0.0);
        Ok(Probe { duration_seconds })
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let s = String::from_utf8_lossy(bytes);
    if s.len() <= max {
        s.into_owned()
    } else {
        s[s.len() - max..].to_string()
    }
}

/// Extracts a `Duration: HH:MM:SS.ss` line as emitted by common muxer
/// binaries on stderr during a probe invocation.
fn parse_duration(stderr: &str) -> Option<f64> {
    let line = stderr.lines().find(|l| l.trim_start().starts_with("Duration:"))?;
    let rest = line.trim_start().strip_prefix("Duration:")?.trim();
    let ts = rest.split(',').next()?.trim();
    let mut parts = ts.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_line() {
        let stderr = "ffmpeg version 6.0\n  Duration: 00:03:21.45, start: 0.000000, bitrate: 128 kb/s\n";
        assert_eq!(parse_duration(stderr), Some(201.45));
    }

    #[test]
    fn missing_duration_line_is_none() {
        assert_eq!(parse_duration("no duration here"), None);
    }

    #[tokio::test]
    async fn missing_binary_reports_not_found() {
        let driver = MuxerDriver::new(PathBuf::from("/nonexistent/definitely-not-a-muxer"));
        assert!(matches!(
            driver.check_available().await,
            Err(MuxerError::MuxerNotFound)
        ));
    }
}
