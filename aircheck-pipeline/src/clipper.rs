//! Audio clip extraction
//!
//! The clipping stage cuts a padded window around each flagged region out
//! of the source recording. Cutting goes through a trait so tests can
//! fake it; the real implementation shells out to ffmpeg/ffprobe.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use aircheck_common::{Error, Result};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait AudioClipper: Send + Sync {
    /// Total duration of an audio file, in seconds.
    async fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Copy `duration` seconds starting at `start` from `src` into `dest`.
    async fn cut(&self, src: &Path, dest: &Path, start: f64, duration: f64) -> Result<()>;
}

/// Clipper backed by the ffmpeg command-line tools.
pub struct FfmpegClipper;

#[async_trait]
impl AudioClipper for FfmpegClipper {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = run_with_timeout(
            Command::new("ffprobe")
                .args(["-v", "error", "-show_entries", "format=duration"])
                .args(["-of", "default=noprint_wrappers=1:nokey=1"])
                .arg(path),
            "ffprobe",
        )
        .await?;

        let text = String::from_utf8_lossy(&output);
        text.trim()
            .parse::<f64>()
            .map_err(|e| Error::Data(format!("unparseable ffprobe duration '{}': {e}", text.trim())))
    }

    async fn cut(&self, src: &Path, dest: &Path, start: f64, duration: f64) -> Result<()> {
        debug!(
            src = %src.display(),
            dest = %dest.display(),
            start, duration,
            "Cutting clip"
        );
        // -ss before -i seeks on the input; stream copy avoids re-encoding.
        run_with_timeout(
            Command::new("ffmpeg")
                .arg("-y")
                .args(["-ss", &format!("{start:.3}")])
                .arg("-i")
                .arg(src)
                .args(["-t", &format!("{duration:.3}")])
                .args(["-c", "copy"])
                .arg(dest),
            "ffmpeg",
        )
        .await?;
        Ok(())
    }
}

async fn run_with_timeout(command: &mut Command, name: &str) -> Result<Vec<u8>> {
    let output = tokio::time::timeout(SUBPROCESS_TIMEOUT, command.output())
        .await
        .map_err(|_| Error::Internal(format!("{name} timed out")))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Internal(format!(
            "{name} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}
