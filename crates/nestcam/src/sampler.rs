use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    models::{EventId, Frame, Recording},
};

/// Turns a recording into still frames. The recording file is consumed.
#[async_trait]
pub trait FrameSampler: Send + Sync {
    async fn sample(&self, recording: &Recording) -> Result<Vec<Frame>>;
}

pub struct FfmpegSampler {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    interval: Duration,
}

impl FfmpegSampler {
    pub fn new(ffmpeg: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            output_dir: output_dir.into(),
            interval,
        }
    }

    async fn extract(&self, recording: &Recording, stem: &str) -> Result<()> {
        let pattern = self.output_dir.join(format!("{stem}_%d.jpg"));

        let output = Command::new(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(&recording.path)
            .arg("-vf")
            .arg(format!("fps=1/{}", self.interval.as_secs_f64()))
            .arg("-start_number")
            .arg("0")
            .arg("-q:v")
            .arg("2")
            .arg(&pattern)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Sampling(format!("Failed to execute ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Sampling(format!("ffmpeg failed: {stderr}")));
        }

        Ok(())
    }
}

#[async_trait]
impl FrameSampler for FfmpegSampler {
    #[tracing::instrument(skip(self, recording), fields(event_id = %recording.event_id))]
    async fn sample(&self, recording: &Recording) -> Result<Vec<Frame>> {
        let stem = recording
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Sampling(format!("Invalid recording path: {}", recording.path.display()))
            })?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let extracted = self.extract(recording, &stem).await;

        // the recording is not needed whether or not extraction worked
        let _ = tokio::fs::remove_file(&recording.path)
            .await
            .inspect_err(|err| warn!(err = ?err, "Failed to remove recording"));
        extracted?;

        let frames = collect_frames(
            &self.output_dir,
            &stem,
            &recording.event_id,
            recording.downloaded_at,
            self.interval,
        )?;
        info!(frames = frames.len(), "Extracted frames from recording");

        Ok(frames)
    }
}

/// Gathers `{stem}_0.jpg`, `{stem}_1.jpg`, ... until the first gap.
pub fn collect_frames(
    dir: &Path,
    stem: &str,
    event_id: &EventId,
    downloaded_at: DateTime<Utc>,
    interval: Duration,
) -> Result<Vec<Frame>> {
    let step = TimeDelta::from_std(interval)
        .map_err(|e| Error::Sampling(format!("Frame interval {interval:?} is out of range: {e}")))?;

    (0..)
        .map(|index| (index, dir.join(format!("{stem}_{index}.jpg"))))
        .take_while(|(_, path)| path.exists())
        .map(|(index, path)| -> Result<Frame> {
            debug!(path = %path.display(), "Found frame");
            let captured_at = i32::try_from(index)
                .ok()
                .and_then(|index| step.checked_mul(index))
                .and_then(|offset| downloaded_at.checked_add_signed(offset))
                .ok_or_else(|| {
                    Error::Sampling(format!("Timestamp of frame {index} is out of range"))
                })?;

            Ok(Frame {
                path,
                event_id: event_id.clone(),
                captured_at,
                index,
            })
        })
        .collect()
}
