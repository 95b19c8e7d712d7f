use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    Error, Result,
    context::Context,
    models::Event,
    poller,
    session::Session,
    task::{
        DriverState, pause,
        pipeline::{self, Mode, Outcome},
    },
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub found: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Processes every event from the last `minutes` once, then exits.
pub struct BatchRun {
    context: Arc<Context>,
    device_name: String,
    minutes: u64,
    mode: Mode,
    cancel: CancellationToken,
    state: DriverState,
}

impl BatchRun {
    pub fn new(
        context: Arc<Context>,
        device_name: impl Into<String>,
        minutes: u64,
        mode: Mode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            device_name: device_name.into(),
            minutes,
            mode,
            cancel,
            state: DriverState::Init,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub async fn run(&mut self) -> Result<BatchSummary> {
        info!(
            device_name = self.device_name,
            minutes = self.minutes,
            mode = ?self.mode,
            "Starting batch run"
        );

        let session = match self.context.sessions.acquire().await {
            Ok(session) => session,
            Err(err) => {
                self.transition(DriverState::Terminated);
                return Err(err);
            }
        };
        self.transition(DriverState::Authenticated);

        let result = self.drive(&session).await;

        self.transition(DriverState::ShuttingDown);
        self.context.sessions.release(session).await;
        self.transition(DriverState::Terminated);

        if let Ok(summary) = &result {
            info!(
                found = summary.found,
                processed = summary.processed,
                skipped = summary.skipped,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "Batch run finished"
            );
        }
        result
    }

    async fn drive(&mut self, session: &Session) -> Result<BatchSummary> {
        let cutoff = window_start(Utc::now(), self.minutes)?;
        let events = poller::events_since(
            session,
            &self.device_name,
            cutoff,
            self.context.config.pipeline.history_limit,
        )
        .await?;
        info!("Found {} events in the last {} minutes", events.len(), self.minutes);

        self.transition(DriverState::Processing);
        process_events(
            &self.context,
            session,
            &self.device_name,
            &events,
            self.mode,
            &self.cancel,
        )
        .await
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, "Batch driver state change");
        self.state = next;
    }
}

/// Runs `events` through the pipeline in order, pacing between upstream calls.
pub async fn process_events(
    context: &Context,
    session: &Session,
    device_name: &str,
    events: &[Event],
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary {
        found: events.len(),
        ..BatchSummary::default()
    };

    for (index, event) in events.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("Interrupted, stopping batch");
            summary.cancelled = true;
            break;
        }

        match pipeline::handle_event(context, session, device_name, &event.id, mode, cancel).await? {
            Outcome::Processed(report) if report.cancelled => {
                summary.cancelled = true;
                break;
            }
            Outcome::Processed(_) => summary.processed += 1,
            Outcome::Skipped => {
                summary.skipped += 1;
                continue;
            }
            Outcome::Failed => summary.failed += 1,
        }

        let last = index + 1 == events.len();
        if !last && !pause(cancel, context.config.pipeline.batch_pacing).await {
            info!("Interrupted, stopping batch");
            summary.cancelled = true;
            break;
        }
    }

    Ok(summary)
}

pub fn window_start(now: DateTime<Utc>, minutes: u64) -> Result<DateTime<Utc>> {
    i64::try_from(minutes)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| Error::Config(format!("a {minutes} minute window is out of range")))
}
