use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    Result,
    models::{Device, Event, EventId},
};

pub mod ring;

/// Receives the serialized credential every time the upstream issues one.
pub type CredentialCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Why a single recording download attempt failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("recording not ready: {0}")]
    NotReady(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Permanent(_))
    }
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("second factor required")]
    SecondFactorRequired,
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Other(#[from] crate::Error),
}

/// An authenticated connection to the camera service.
#[async_trait]
pub trait CameraApi: Send + Sync {
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Most recent first, at most `limit` entries.
    async fn history(&self, device: &Device, limit: usize) -> Result<Vec<Event>>;

    /// Writes the recording for `event_id` to `dest`. On failure nothing is left at `dest`.
    async fn download(
        &self,
        device: &Device,
        event_id: &EventId,
        dest: &Path,
    ) -> std::result::Result<(), FetchError>;

    async fn close(&self);
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resume(
        &self,
        credential: &str,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError>;

    async fn login(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError>;
}
