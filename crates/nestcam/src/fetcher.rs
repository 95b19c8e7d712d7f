use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    Error, Result,
    camera::FetchError,
    metrics::{self, Metrics},
    models::{EventId, Recording},
    session::Session,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct RetryPolicy {
    /// `None` retries until the recording shows up.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(with = "humantime_serde", default = "default_delay")]
    pub delay: Duration,
    #[serde(default)]
    pub backoff: Backoff,
    /// Also retry failures the upstream reports as permanent.
    #[serde(default = "default_retry_permanent")]
    pub retry_permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential {
        factor: f64,
        #[serde(rename = "max-delay", with = "humantime_serde")]
        max_delay: Duration,
    },
}

fn default_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_permanent() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: default_delay(),
            backoff: Backoff::default(),
            retry_permanent: default_retry_permanent(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = self.delay.as_secs_f64() * factor.powi(exponent);
                if secs.is_finite() && secs < max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    *max_delay
                }
            }
        }
    }

    /// Whether another attempt follows `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, err: &FetchError) -> bool {
        if !err.is_retryable() && !self.retry_permanent {
            return false;
        }
        self.max_attempts
            .is_none_or(|max_attempts| attempts_made < max_attempts)
    }
}

pub struct RecordingFetcher {
    dir: PathBuf,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl RecordingFetcher {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            dir: dir.into(),
            policy,
            metrics,
        }
    }

    /// Downloads the recording for `event_id`, retrying until it is published
    /// or the retry policy gives up.
    pub async fn fetch(
        &self,
        session: &Session,
        device_name: &str,
        event_id: &EventId,
    ) -> Result<Recording> {
        let device = session
            .resolve_device(device_name)
            .ok_or_else(|| Error::DeviceNotFound(device_name.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let downloaded_at = Utc::now();
        let path = self
            .dir
            .join(recording_filename(&device.id, event_id, downloaded_at));

        let mut attempts = 0;
        loop {
            attempts += 1;

            match session.api().download(device, event_id, &path).await {
                Ok(()) => {
                    info!(event_id = %event_id, path = %path.display(), attempts, "Downloaded recording");
                    return Ok(Recording {
                        path,
                        device_id: device.id.clone(),
                        event_id: event_id.clone(),
                        downloaded_at,
                    });
                }
                Err(err) if self.policy.should_retry(attempts, &err) => {
                    let delay = self.policy.delay_for(attempts);
                    warn!(
                        event_id = %event_id,
                        attempts,
                        delay = ?delay,
                        err = %err,
                        "Recording not available yet, retrying"
                    );
                    metrics::increment(&self.metrics.pipeline.fetch_retries);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(Error::Fetch(format!(
                        "event {event_id} after {attempts} attempt(s): {err}"
                    )));
                }
            }
        }
    }
}

pub fn recording_filename(device_id: &str, event_id: &EventId, at: DateTime<Utc>) -> String {
    format!("{device_id}_{event_id}_{}.mp4", at.format("%Y%m%d%H%M%S"))
}
