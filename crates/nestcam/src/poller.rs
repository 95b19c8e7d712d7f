use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    Result,
    models::{Event, EventCursor},
    session::Session,
};

/// The most recent event for the named camera, if it has any history.
pub async fn latest_event(session: &Session, device_name: &str) -> Result<Option<Event>> {
    let Some(device) = session.resolve_device(device_name) else {
        warn!(device_name, "No camera available to poll");
        return Ok(None);
    };

    let latest = session.api().history(device, 1).await?.into_iter().next();
    if latest.is_none() {
        info!(device = device.name, "No events found");
    }

    Ok(latest)
}

/// The latest event, but only when it differs from what the cursor last saw.
pub async fn poll_for_new(
    session: &Session,
    device_name: &str,
    cursor: &EventCursor,
) -> Result<Option<Event>> {
    match latest_event(session, device_name).await? {
        Some(event) if cursor.is_new(&event.id) => {
            info!(event_id = %event.id, previous = %cursor, "New recording event detected");
            Ok(Some(event))
        }
        Some(event) => {
            debug!(event_id = %event.id, "No new recording event");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Events created at or after `cutoff`, in upstream order (newest first).
/// Only the first `max_items` history entries are considered.
pub async fn events_since(
    session: &Session,
    device_name: &str,
    cutoff: DateTime<Utc>,
    max_items: usize,
) -> Result<Vec<Event>> {
    let Some(device) = session.resolve_device(device_name) else {
        warn!(device_name, "No camera available to list events for");
        return Ok(vec![]);
    };
    if max_items == 0 {
        return Ok(vec![]);
    }

    let history = session.api().history(device, max_items).await?;

    Ok(history
        .into_iter()
        .take(max_items)
        .filter(|event| event.created_at >= cutoff)
        .collect())
}
