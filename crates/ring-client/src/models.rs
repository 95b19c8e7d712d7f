use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Seconds before the nominal expiry at which a token is treated as stale.
const EXPIRY_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Fills in `expires_at` from `expires_in` for a freshly issued token.
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| now + Duration::seconds(secs));
        }
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now + Duration::seconds(EXPIRY_LEEWAY_SECS) >= at)
    }
}

/// Everything needed to resume a session without logging in again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub token: Token,
    pub hardware_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    StickupCams,
    Doorbots,
    AuthorizedDoorbots,
    Chimes,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Devices {
    #[serde(default)]
    pub stickup_cams: Vec<Device>,
    #[serde(default)]
    pub doorbots: Vec<Device>,
    #[serde(default)]
    pub authorized_doorbots: Vec<Device>,
    #[serde(default)]
    pub chimes: Vec<Device>,
    #[serde(default)]
    pub other: Vec<Device>,
}

impl Devices {
    pub fn family(&self, family: DeviceFamily) -> &[Device] {
        match family {
            DeviceFamily::StickupCams => &self.stickup_cams,
            DeviceFamily::Doorbots => &self.doorbots,
            DeviceFamily::AuthorizedDoorbots => &self.authorized_doorbots,
            DeviceFamily::Chimes => &self.chimes,
            DeviceFamily::Other => &self.other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra_fields: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub recording: Option<RecordingStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStatus {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RecordingUrl {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n.to_string(),
        RawId::Text(s) => s,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Rfc3339(DateTime<Utc>),
    Seconds(i64),
    FractionalSeconds(f64),
}

fn timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Rfc3339(dt) => Some(dt),
        RawTimestamp::Seconds(secs) => DateTime::from_timestamp(secs, 0),
        RawTimestamp::FractionalSeconds(secs) => DateTime::from_timestamp_millis((secs * 1000.0) as i64),
    };
    parsed.ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
}
