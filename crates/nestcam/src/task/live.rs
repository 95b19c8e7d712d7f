use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Result,
    context::Context,
    metrics,
    models::EventCursor,
    poller,
    session::Session,
    task::{
        DriverState, pause,
        batch::{process_events, window_start},
        pipeline::{self, Mode},
    },
};

/// Polls one camera until interrupted, processing each event the first time
/// it shows up as the latest.
pub struct LiveLoop {
    context: Arc<Context>,
    device_name: String,
    catch_up_minutes: u64,
    cancel: CancellationToken,
    cursor: EventCursor,
    state: DriverState,
}

impl LiveLoop {
    pub fn new(
        context: Arc<Context>,
        device_name: impl Into<String>,
        catch_up_minutes: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            device_name: device_name.into(),
            catch_up_minutes,
            cancel,
            cursor: EventCursor::new(),
            state: DriverState::Init,
        }
    }

    pub fn cursor(&self) -> &EventCursor {
        &self.cursor
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(device_name = self.device_name, "Starting live capture");

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

        result
    }

    async fn drive(&mut self, session: &Session) -> Result<()> {
        if self.catch_up_minutes > 0 {
            self.catch_up(session).await?;
        }

        let pipeline_config = self.context.config.pipeline.clone();
        loop {
            self.transition(DriverState::Polling);
            if !pause(&self.cancel, pipeline_config.poll_interval).await {
                info!("Interrupted, shutting down");
                return Ok(());
            }

            metrics::increment(&self.context.metrics.pipeline.polls);
            let event = match poller::poll_for_new(session, &self.device_name, &self.cursor).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                // the session is already established, so even an auth failure
                // here is retried on the next poll
                Err(err) => {
                    warn!(err = %err, "Failed to poll for events");
                    continue;
                }
            };

            self.transition(DriverState::Processing);
            let outcome = pipeline::handle_event(
                &self.context,
                session,
                &self.device_name,
                &event.id,
                Mode::Score,
                &self.cancel,
            )
            .await;
            self.cursor.advance(event.id);
            outcome?;

            if !pause(&self.cancel, pipeline_config.cooldown).await {
                info!("Interrupted, shutting down");
                return Ok(());
            }
        }
    }

    /// Processes the recent window before live polling starts. The cursor
    /// starts at the newest event of the window so it is not processed twice.
    async fn catch_up(&mut self, session: &Session) -> Result<()> {
        self.transition(DriverState::Processing);

        let cutoff = window_start(Utc::now(), self.catch_up_minutes)?;
        let events = match poller::events_since(
            session,
            &self.device_name,
            cutoff,
            self.context.config.pipeline.history_limit,
        )
        .await
        {
            Ok(events) => events,
            Err(err) => {
                warn!(err = %err, "Failed to list recent events, skipping catch-up");
                return Ok(());
            }
        };

        if let Some(newest) = events.first() {
            self.cursor.advance(newest.id.clone());
        }
        info!(
            events = events.len(),
            minutes = self.catch_up_minutes,
            "Catching up on recent events"
        );

        process_events(
            &self.context,
            session,
            &self.device_name,
            &events,
            Mode::Score,
            &self.cancel,
        )
        .await?;

        Ok(())
    }

    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, cursor = %self.cursor, "Live driver state change");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::{
        Error,
        camera::FetchError,
        models::EventId,
        testing::{FakeCamera, FakeScorer, Harness, camera, event},
    };

    fn front_door() -> FakeCamera {
        FakeCamera::new(vec![camera("42", "Front Door")])
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_new_event_is_processed_once() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("A", 1)])
                .cancel_after_polls(3, cancel.clone()),
        );
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel);

        let started = Instant::now();
        live.run().await.unwrap();

        assert_eq!(harness.camera.downloaded_events(), vec!["A"]);
        assert_eq!(live.cursor().last(), Some(&EventId::from("A")));
        assert_eq!(harness.camera.history_calls(), 3);
        // three polls of 5s plus one cooldown of 10s
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert!(harness.camera.is_closed());
        assert_eq!(live.state(), DriverState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_latest_event_is_picked_up() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("A", 2)])
                .then_history(vec![event("B", 1), event("A", 2)])
                .cancel_after_polls(3, cancel.clone()),
        );
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel);

        live.run().await.unwrap();

        assert_eq!(harness.camera.downloaded_events(), vec!["A", "B"]);
        assert_eq!(live.cursor().last(), Some(&EventId::from("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_advances_even_when_processing_fails() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("A", 1)])
                .with_download_failures(vec![FetchError::Permanent("gone".into())])
                .cancel_after_polls(2, cancel.clone()),
        )
        .with_strict_retries();
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel);

        live.run().await.unwrap();

        assert_eq!(live.cursor().last(), Some(&EventId::from("A")));
        assert_eq!(harness.camera.download_attempts(), 1);
        assert_eq!(harness.sampler.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_do_not_end_the_run() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("A", 1)])
                .with_history_failures(vec![
                    Error::Auth("Token refresh failed: 503 Service Unavailable".into()),
                    Error::General("connection reset".into()),
                ])
                .cancel_after_polls(4, cancel.clone()),
        );
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel);

        live.run().await.unwrap();

        assert_eq!(harness.camera.history_calls(), 4);
        assert_eq!(harness.camera.downloaded_events(), vec!["A"]);
        assert_eq!(live.cursor().last(), Some(&EventId::from("A")));
        assert!(harness.camera.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_listing_failure_falls_through_to_polling() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("B", 1), event("A", 2)])
                .with_history_failures(vec![Error::Auth("Token refresh failed: 429".into())])
                .cancel_after_polls(3, cancel.clone()),
        );
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 60, cancel);

        live.run().await.unwrap();

        // only the latest event is seen once live polling starts
        assert_eq!(harness.camera.downloaded_events(), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_history_keeps_polling() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(front_door().cancel_after_polls(4, cancel.clone()));
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel);

        live.run().await.unwrap();

        assert_eq!(harness.camera.history_calls(), 4);
        assert!(live.cursor().last().is_none());
        assert_eq!(harness.camera.download_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_loop_and_closes_session() {
        let harness = Harness::new(front_door().with_history(vec![event("A", 1)]))
            .with_scorer(FakeScorer::misconfigured());
        let mut live = LiveLoop::new(
            harness.context().await,
            "Front Door",
            0,
            CancellationToken::new(),
        );

        let result = live.run().await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(live.cursor().last(), Some(&EventId::from("A")));
        assert!(harness.camera.is_closed());
        assert_eq!(live.state(), DriverState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_poll_sleep() {
        let harness = Harness::new(front_door().with_history(vec![event("A", 1)]));
        let cancel = CancellationToken::new();
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 0, cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        live.run().await.unwrap();
        trigger.await.unwrap();

        assert_eq!(harness.camera.history_calls(), 0);
        assert!(harness.camera.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_window_runs_first() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(
            front_door()
                .with_history(vec![event("C", 1), event("B", 2), event("A", 90)])
                .cancel_after_polls(2, cancel.clone()),
        );
        let mut live = LiveLoop::new(harness.context().await, "Front Door", 60, cancel);

        live.run().await.unwrap();

        // the first live poll sees C again and leaves it alone
        assert_eq!(harness.camera.downloaded_events(), vec!["C", "B"]);
        assert_eq!(live.cursor().last(), Some(&EventId::from("C")));
    }

    #[tokio::test]
    async fn test_auth_failure_never_opens_a_session() {
        let harness = Harness::new(front_door()).without_credentials();
        let mut live = LiveLoop::new(
            harness.context().await,
            "Front Door",
            0,
            CancellationToken::new(),
        );

        let result = live.run().await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(live.state(), DriverState::Terminated);
        assert_eq!(harness.camera.history_calls(), 0);
    }
}
