use std::sync::Arc;

use nestcam_data::Database;

use crate::{
    camera::ring::RingAuthenticator,
    config::Config,
    credentials::FileCredentialStore,
    fetcher::RecordingFetcher,
    metrics::Metrics,
    sampler::{FfmpegSampler, FrameSampler},
    scoring::{LandingLensScorer, Scorer},
    session::{SessionManager, StdinOtpPrompt},
    sink::{self, ResultSink},
};

pub struct Context {
    pub config: Config,
    pub sessions: SessionManager,
    pub fetcher: RecordingFetcher,
    pub sampler: Arc<dyn FrameSampler>,
    pub scorer: Arc<dyn Scorer>,
    pub sink: Arc<dyn ResultSink>, // dyn b/c the sink is picked from config at runtime
    pub ledger: Option<Database>,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> crate::Result<Self> {
        let sessions = SessionManager::new(
            config.ring.clone(),
            Arc::new(RingAuthenticator::new(config.ring.client_config())),
            Arc::new(FileCredentialStore::new(config.ring.credential_dir.clone())),
            Arc::new(StdinOtpPrompt),
        );

        let ledger = match &config.dedup {
            Some(dedup) => Some(Database::new(&dedup.path).await?),
            None => None,
        };

        Ok(Self {
            sessions,
            fetcher: RecordingFetcher::new(
                config.pipeline.recording_dir.clone(),
                config.pipeline.retry.clone(),
                metrics.clone(),
            ),
            sampler: Arc::new(FfmpegSampler::new(
                config.pipeline.ffmpeg_path.clone(),
                config.pipeline.frame_dir.clone(),
                config.pipeline.frame_interval,
            )),
            scorer: Arc::new(LandingLensScorer::new(config.scoring.clone())?),
            sink: sink::sink_target(&config.sink).await?,
            ledger,
            metrics,
            config,
        })
    }

    /// Releases the sink and ledger. The upstream session is released by the driver.
    pub async fn close(&self) {
        self.sink.close().await;
        if let Some(ledger) = &self.ledger {
            ledger.close().await;
        }
    }
}
