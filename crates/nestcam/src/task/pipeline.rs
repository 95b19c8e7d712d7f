use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Result,
    context::Context,
    convert,
    metrics,
    models::{EventId, Frame},
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Score every frame and store predictions alongside the images.
    Score,
    /// Upload frames only.
    Collect,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventReport {
    pub device_id: String,
    pub frames: usize,
    pub frames_uploaded: usize,
    pub predictions: usize,
    pub failures: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed(EventReport),
    Skipped,
    Failed,
}

/// Fetch, sample, then score and upload each frame of one event.
///
/// Per-frame failures are logged and counted; only fatal errors are returned
/// once frames exist. Cancellation is checked before the download and between
/// frames. Frames not yet uploaded when cancelled are deleted.
pub async fn process_event(
    context: &Context,
    session: &Session,
    device_name: &str,
    event_id: &EventId,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<EventReport> {
    let mut report = EventReport::default();
    if cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    info!(event_id = %event_id, ?mode, "Processing event");

    let recording = context.fetcher.fetch(session, device_name, event_id).await?;
    report.device_id = recording.device_id.clone();

    let frames = context.sampler.sample(&recording).await?;
    report.frames = frames.len();
    metrics::add(
        &context.metrics.pipeline.frames_extracted,
        frames.len() as u64,
    );

    for (position, frame) in frames.iter().enumerate() {
        if cancel.is_cancelled() {
            info!(
                event_id = %event_id,
                remaining = frames.len() - position,
                "Interrupted, discarding frames that were not uploaded"
            );
            discard_frames(&frames[position..]).await;
            report.cancelled = true;
            break;
        }

        let predictions = match mode {
            Mode::Collect => vec![],
            Mode::Score => match context.scorer.predict(frame).await {
                Ok(predictions) => predictions,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(err = %err, frame = %frame.filename(), "Failed to score frame");
                    report.failures += 1;
                    vec![]
                }
            },
        };

        match context.sink.put_frame(frame).await {
            Ok(()) => {
                report.frames_uploaded += 1;
                metrics::increment(&context.metrics.pipeline.frames_uploaded);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(err = %err, frame = %frame.filename(), "Failed to upload frame");
                report.failures += 1;
            }
        }

        for prediction in &predictions {
            let row = convert::prediction_row(frame, context.scorer.endpoint_id(), prediction)?;
            match context.sink.insert_prediction(&row).await {
                Ok(()) => {
                    report.predictions += 1;
                    metrics::increment(&context.metrics.pipeline.predictions_inserted);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(err = %err, id = prediction.id, "Failed to insert prediction");
                    report.failures += 1;
                }
            }
        }
    }

    metrics::add(
        &context.metrics.pipeline.stage_failures,
        report.failures as u64,
    );
    info!(
        event_id = %event_id,
        frames = report.frames,
        uploaded = report.frames_uploaded,
        predictions = report.predictions,
        failures = report.failures,
        "Finished processing event"
    );

    Ok(report)
}

/// Runs one event through the pipeline, consulting the processed-event ledger
/// when one is configured. Only fatal errors are returned.
pub async fn handle_event(
    context: &Context,
    session: &Session,
    device_name: &str,
    event_id: &EventId,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    if already_processed(context, event_id).await {
        info!(event_id = %event_id, "Event already processed, skipping");
        metrics::increment(&context.metrics.pipeline.events_skipped);
        return Ok(Outcome::Skipped);
    }

    match process_event(context, session, device_name, event_id, mode, cancel).await {
        Ok(report) => {
            if !report.cancelled {
                metrics::increment(&context.metrics.pipeline.events_processed);
                record_processed(context, event_id, &report.device_id).await;
            }
            Ok(Outcome::Processed(report))
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(err = %err, event_id = %event_id, "Failed to process event");
            metrics::increment(&context.metrics.pipeline.events_failed);
            Ok(Outcome::Failed)
        }
    }
}

async fn discard_frames(frames: &[Frame]) {
    for frame in frames {
        if let Err(err) = tokio::fs::remove_file(&frame.path).await {
            warn!(err = ?err, path = %frame.path.display(), "Failed to remove frame");
        }
    }
}

async fn already_processed(context: &Context, event_id: &EventId) -> bool {
    let Some(ledger) = &context.ledger else {
        return false;
    };

    ledger
        .is_event_processed(event_id.as_str())
        .await
        .inspect_err(|err| warn!(err = ?err, "Failed to read processed-event ledger"))
        .unwrap_or(false)
}

async fn record_processed(context: &Context, event_id: &EventId, device_id: &str) {
    if let Some(ledger) = &context.ledger {
        match ledger.mark_event_processed(event_id.as_str(), device_id).await {
            Ok(()) => debug!(event_id = %event_id, "Recorded processed event"),
            Err(err) => warn!(err = ?err, "Failed to record processed event"),
        }
    }
}
