//! In-process fakes for the upstream service and every pipeline stage.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use nestcam_data::{Database, PredictionRecord};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result,
    camera::{Authenticator, CameraApi, CredentialCallback, FetchError, LoginError},
    config::{Config, RingConfig},
    context::Context,
    credentials::MemoryCredentialStore,
    fetcher::{RecordingFetcher, RetryPolicy},
    metrics::Metrics,
    models::{Device, DeviceKind, Event, EventId, Frame, Prediction, Recording},
    sampler::{FrameSampler, collect_frames},
    scoring::Scorer,
    session::{OtpPrompt, Session, SessionManager},
    sink::ResultSink,
};

pub fn camera(id: &str, name: &str) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        kind: DeviceKind::Camera,
    }
}

pub fn chime(id: &str, name: &str) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        kind: DeviceKind::Chime,
    }
}

pub fn event(id: &str, minutes_ago: i64) -> Event {
    Event {
        id: EventId::from(id),
        created_at: Utc::now() - Duration::minutes(minutes_ago),
        kind: Some("motion".to_string()),
    }
}

pub fn ring_config() -> RingConfig {
    RingConfig {
        username: Some("user".to_string()),
        password: Some("pw".to_string()),
        user_agent: "nestcam".to_string(),
        ..Config::default().ring
    }
}

#[derive(Default)]
pub struct FakeCamera {
    pub devices: Vec<Device>,
    history: Vec<Vec<Event>>,
    history_calls: AtomicUsize,
    history_failures: Mutex<VecDeque<Error>>,
    download_failures: Mutex<VecDeque<FetchError>>,
    download_attempts: AtomicUsize,
    downloaded: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
    closed: AtomicBool,
}

impl FakeCamera {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    pub fn with_history(mut self, events: Vec<Event>) -> Self {
        self.history = vec![events];
        self
    }

    /// Served from the next history call on. The last entry repeats.
    pub fn then_history(mut self, events: Vec<Event>) -> Self {
        self.history.push(events);
        self
    }

    /// Each history call pops one failure until none are left.
    pub fn with_history_failures(self, failures: Vec<Error>) -> Self {
        *self.history_failures.lock().unwrap() = failures.into();
        self
    }

    /// Each download attempt pops one failure until none are left.
    pub fn with_download_failures(self, failures: Vec<FetchError>) -> Self {
        *self.download_failures.lock().unwrap() = failures.into();
        self
    }

    pub fn cancel_after_polls(mut self, polls: usize, cancel: CancellationToken) -> Self {
        self.cancel_after = Some((polls, cancel));
        self
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn download_attempts(&self) -> usize {
        self.download_attempts.load(Ordering::SeqCst)
    }

    /// Events whose download succeeded, in order.
    pub fn downloaded_events(&self) -> Vec<String> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraApi for FakeCamera {
    async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }

    async fn history(&self, _device: &Device, limit: usize) -> Result<Vec<Event>> {
        let call = self.history_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((polls, cancel)) = &self.cancel_after {
            if call >= *polls {
                cancel.cancel();
            }
        }
        if let Some(failure) = self.history_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }

        let events = self
            .history
            .get(call - 1)
            .or(self.history.last())
            .cloned()
            .unwrap_or_default();
        Ok(events.into_iter().take(limit).collect())
    }

    async fn download(
        &self,
        _device: &Device,
        event_id: &EventId,
        dest: &Path,
    ) -> std::result::Result<(), FetchError> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.download_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }

        std::fs::write(dest, b"mp4").map_err(|e| FetchError::Transient(e.to_string()))?;
        self.downloaded.lock().unwrap().push(event_id.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeAuthenticator {
    camera: Arc<FakeCamera>,
    accept_cached: bool,
    otp: Option<String>,
    reject: bool,
    login_attempts: Mutex<Vec<Option<String>>>,
}

impl FakeAuthenticator {
    pub fn new(camera: Arc<FakeCamera>) -> Self {
        Self {
            camera,
            accept_cached: false,
            otp: None,
            reject: false,
            login_attempts: Mutex::new(vec![]),
        }
    }

    pub fn accepting_cached(mut self) -> Self {
        self.accept_cached = true;
        self
    }

    pub fn requiring_otp(mut self, code: &str) -> Self {
        self.otp = Some(code.to_string());
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn login_attempts(&self) -> Vec<Option<String>> {
        self.login_attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn resume(
        &self,
        _credential: &str,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError> {
        if !self.accept_cached {
            return Err(LoginError::Rejected("refresh token expired".to_string()));
        }
        on_credential("refreshed-token");
        Ok(self.camera.clone())
    }

    async fn login(
        &self,
        _username: &str,
        _password: &str,
        otp: Option<&str>,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError> {
        self.login_attempts
            .lock()
            .unwrap()
            .push(otp.map(str::to_string));

        if self.reject {
            return Err(LoginError::Rejected("invalid password".to_string()));
        }
        match (&self.otp, otp) {
            (Some(_), None) => return Err(LoginError::SecondFactorRequired),
            (Some(expected), Some(given)) if expected != given => {
                return Err(LoginError::Rejected("invalid 2fa code".to_string()));
            }
            _ => {}
        }

        on_credential("fresh-token");
        Ok(self.camera.clone())
    }
}

pub struct FakeOtp {
    code: String,
    prompts: AtomicUsize,
}

impl FakeOtp {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OtpPrompt for FakeOtp {
    async fn second_factor(&self) -> Result<String> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.code.clone())
    }
}

/// Writes three frames per recording and consumes the recording.
pub struct FakeSampler {
    output_dir: PathBuf,
    calls: AtomicUsize,
}

impl FakeSampler {
    pub const FRAMES: usize = 3;

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSampler for FakeSampler {
    async fn sample(&self, recording: &Recording) -> Result<Vec<Frame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let stem = recording
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Sampling("recording has no file name".to_string()))?;
        std::fs::create_dir_all(&self.output_dir)?;
        for index in 0..Self::FRAMES {
            std::fs::write(self.output_dir.join(format!("{stem}_{index}.jpg")), b"jpg")?;
        }
        std::fs::remove_file(&recording.path)?;

        collect_frames(
            &self.output_dir,
            &stem,
            &recording.event_id,
            recording.downloaded_at,
            std::time::Duration::from_secs(3),
        )
    }
}

#[derive(Clone, Copy)]
enum ScorerBehaviour {
    Predicting,
    Failing,
    Misconfigured,
}

pub struct FakeScorer {
    behaviour: ScorerBehaviour,
    calls: AtomicUsize,
}

impl Default for FakeScorer {
    fn default() -> Self {
        Self::predicting()
    }
}

impl FakeScorer {
    fn with(behaviour: ScorerBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
        }
    }

    /// One "person" detection per frame.
    pub fn predicting() -> Self {
        Self::with(ScorerBehaviour::Predicting)
    }

    pub fn failing() -> Self {
        Self::with(ScorerBehaviour::Failing)
    }

    pub fn misconfigured() -> Self {
        Self::with(ScorerBehaviour::Misconfigured)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for FakeScorer {
    fn endpoint_id(&self) -> &str {
        "fake-endpoint"
    }

    async fn predict(&self, frame: &Frame) -> Result<Vec<Prediction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            ScorerBehaviour::Predicting => Ok(vec![Prediction {
                id: format!("{}#person", frame.filename()),
                label_name: "person".to_string(),
                label_index: 1,
                score: 0.93,
                bboxes: None,
            }]),
            ScorerBehaviour::Failing => Err(Error::Scoring("503 Service Unavailable".to_string())),
            ScorerBehaviour::Misconfigured => {
                Err(Error::Config("endpoint id is not configured".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct FakeSink {
    fail_uploads: bool,
    cancel_after: Option<(usize, CancellationToken)>,
    uploaded: Mutex<Vec<String>>,
    rows: Mutex<Vec<PredictionRecord>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads() -> Self {
        Self {
            fail_uploads: true,
            ..Self::default()
        }
    }

    /// Cancels `cancel` once `uploads` frames have been put.
    pub fn cancelling_after(mut self, uploads: usize, cancel: CancellationToken) -> Self {
        self.cancel_after = Some((uploads, cancel));
        self
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<PredictionRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for FakeSink {
    async fn put_frame(&self, frame: &Frame) -> Result<()> {
        if self.fail_uploads {
            return Err(Error::Sink("stage unreachable".to_string()));
        }
        std::fs::remove_file(&frame.path)?;
        let uploads = {
            let mut uploaded = self.uploaded.lock().unwrap();
            uploaded.push(frame.filename());
            uploaded.len()
        };
        if let Some((after, cancel)) = &self.cancel_after {
            if uploads >= *after {
                cancel.cancel();
            }
        }
        Ok(())
    }

    async fn insert_prediction(&self, row: &PredictionRecord) -> Result<()> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// Wires the fakes into a [`Context`] rooted in a temporary directory.
pub struct Harness {
    pub camera: Arc<FakeCamera>,
    pub authenticator: Arc<FakeAuthenticator>,
    pub sampler: Arc<FakeSampler>,
    pub scorer: Arc<FakeScorer>,
    pub sink: Arc<FakeSink>,
    pub store: Arc<MemoryCredentialStore>,
    pub dir: TempDir,
    config: Config,
}

impl Harness {
    pub fn new(camera: FakeCamera) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(camera);

        let mut config = Config::default();
        config.ring = ring_config();
        config.pipeline.recording_dir = dir.path().join("recordings");
        config.pipeline.frame_dir = dir.path().join("frames");

        Self {
            authenticator: Arc::new(FakeAuthenticator::new(camera.clone())),
            sampler: Arc::new(FakeSampler::new(config.pipeline.frame_dir.clone())),
            scorer: Arc::new(FakeScorer::predicting()),
            sink: Arc::new(FakeSink::new()),
            store: Arc::new(MemoryCredentialStore::new()),
            camera,
            dir,
            config,
        }
    }

    pub fn with_sink(mut self, sink: FakeSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_scorer(mut self, scorer: FakeScorer) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    /// A single download attempt and no retry on permanent failures.
    pub fn with_strict_retries(mut self) -> Self {
        self.config.pipeline.retry = RetryPolicy {
            max_attempts: Some(1),
            retry_permanent: false,
            ..RetryPolicy::default()
        };
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.config.ring.username = None;
        self.config.ring.password = None;
        self
    }

    pub async fn context(&self) -> Arc<Context> {
        Arc::new(self.build_context(None))
    }

    pub async fn context_with_ledger(&self) -> Arc<Context> {
        let ledger = Database::in_memory().await.unwrap();
        Arc::new(self.build_context(Some(ledger)))
    }

    /// A session on the fake camera that bypasses authentication.
    pub fn session(&self) -> Session {
        Session::new(self.camera.clone(), self.camera.devices.clone())
    }

    pub fn files_on_disk(&self) -> usize {
        [
            &self.config.pipeline.recording_dir,
            &self.config.pipeline.frame_dir,
        ]
        .into_iter()
        .filter_map(|dir| std::fs::read_dir(dir).ok())
        .flat_map(|entries| entries.filter_map(|entry| entry.ok()))
        .filter(|entry| entry.path().is_file())
        .count()
    }

    fn build_context(&self, ledger: Option<Database>) -> Context {
        let metrics = Arc::new(Metrics::default());

        Context {
            sessions: SessionManager::new(
                self.config.ring.clone(),
                self.authenticator.clone(),
                self.store.clone(),
                Arc::new(FakeOtp::new("123456")),
            ),
            fetcher: RecordingFetcher::new(
                self.config.pipeline.recording_dir.clone(),
                self.config.pipeline.retry.clone(),
                metrics.clone(),
            ),
            sampler: self.sampler.clone(),
            scorer: self.scorer.clone(),
            sink: self.sink.clone(),
            ledger,
            metrics,
            config: self.config.clone(),
        }
    }
}
