use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an empty cursor is rendered in logs.
pub const CURSOR_SENTINEL: &str = "-1";

/// Upstream-assigned event identifier. Opaque: only compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    Doorbell,
    Chime,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub created_at: DateTime<Utc>,
    pub kind: Option<String>,
}

/// The last event id seen by the live loop. Starts empty and is only ever
/// replaced by a newer observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventCursor {
    last: Option<EventId>,
}

impl EventCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, id: &EventId) -> bool {
        self.last.as_ref() != Some(id)
    }

    pub fn advance(&mut self, id: EventId) {
        self.last = Some(id);
    }

    pub fn last(&self) -> Option<&EventId> {
        self.last.as_ref()
    }
}

impl Display for EventCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last {
            Some(id) => write!(f, "{id}"),
            None => f.write_str(CURSOR_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub path: PathBuf,
    pub device_id: String,
    pub event_id: EventId,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub path: PathBuf,
    pub event_id: EventId,
    pub captured_at: DateTime<Utc>,
    pub index: usize,
}

impl Frame {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `[xmin, ymin, xmax, ymax]` in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox(pub [f64; 4]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub label_name: String,
    pub label_index: i64,
    pub score: f64,
    pub bboxes: Option<BoundingBox>,
}
