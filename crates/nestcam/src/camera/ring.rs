use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use ring_client::{CredentialListener, RingClient, config::ClientConfig, models::Credential};
use tracing::{debug, warn};

use super::{Authenticator, CameraApi, CredentialCallback, FetchError, LoginError};
use crate::{
    Result, convert,
    models::{Device, Event, EventId},
};

pub struct RingAuthenticator {
    config: ClientConfig,
}

impl RingAuthenticator {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Authenticator for RingAuthenticator {
    async fn resume(
        &self,
        credential: &str,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError> {
        let credential: Credential = serde_json::from_str(credential)
            .map_err(|e| LoginError::Rejected(format!("unreadable cached credential: {e}")))?;

        let client = RingClient::resume(
            self.config.clone(),
            credential,
            Some(listener(on_credential)),
        )
        .map_err(login_error)?;
        client.create_session().await.map_err(login_error)?;

        Ok(Arc::new(RingCamera { client }))
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
        on_credential: CredentialCallback,
    ) -> std::result::Result<Arc<dyn CameraApi>, LoginError> {
        let client = RingClient::new(self.config.clone(), Some(listener(on_credential)))
            .map_err(login_error)?;
        client
            .login(username, password, otp)
            .await
            .map_err(login_error)?;
        client.create_session().await.map_err(login_error)?;

        Ok(Arc::new(RingCamera { client }))
    }
}

fn listener(on_credential: CredentialCallback) -> CredentialListener {
    Arc::new(move |credential: &Credential| match serde_json::to_string(credential) {
        Ok(blob) => on_credential(&blob),
        Err(err) => warn!(err = ?err, "Failed to serialize refreshed credential"),
    })
}

fn login_error(err: ring_client::error::Error) -> LoginError {
    match err {
        ring_client::error::Error::Requires2fa => LoginError::SecondFactorRequired,
        ring_client::error::Error::Auth(message) => LoginError::Rejected(message),
        other => LoginError::Other(other.into()),
    }
}

pub struct RingCamera {
    client: RingClient,
}

#[async_trait]
impl CameraApi for RingCamera {
    async fn devices(&self) -> Result<Vec<Device>> {
        let devices = self.client.devices().await?;
        Ok(convert::devices_from_ring(&devices))
    }

    async fn history(&self, device: &Device, limit: usize) -> Result<Vec<Event>> {
        let history = self.client.history(&device.id, limit).await?;
        debug!(device_id = device.id, count = history.len(), "Fetched history");
        Ok(history
            .into_iter()
            .map(convert::event_from_history)
            .collect())
    }

    async fn download(
        &self,
        _device: &Device,
        event_id: &EventId,
        dest: &Path,
    ) -> std::result::Result<(), FetchError> {
        self.client
            .download_recording(event_id.as_str(), dest)
            .await
            .map(|_| ())
            .map_err(fetch_error)
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

fn fetch_error(err: ring_client::error::Error) -> FetchError {
    match err {
        ring_client::error::Error::NotReady(message) => FetchError::NotReady(message),
        err if err.is_retryable() => FetchError::Transient(err.to_string()),
        err => FetchError::Permanent(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classification() {
        use ring_client::error::Error as RingError;

        assert_eq!(
            fetch_error(RingError::NotReady("404".into())),
            FetchError::NotReady("404".into())
        );
        assert!(matches!(
            fetch_error(RingError::Api {
                status: 503,
                message: "busy".into()
            }),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            fetch_error(RingError::Api {
                status: 400,
                message: "bad".into()
            }),
            FetchError::Permanent(_)
        ));
        assert!(matches!(fetch_error(RingError::Closed), FetchError::Permanent(_)));
    }

    #[test]
    fn test_login_error_classification() {
        use ring_client::error::Error as RingError;

        assert!(matches!(
            login_error(RingError::Requires2fa),
            LoginError::SecondFactorRequired
        ));
        assert!(matches!(
            login_error(RingError::Auth("bad password".into())),
            LoginError::Rejected(_)
        ));
        assert!(matches!(
            login_error(RingError::General("boom".into())),
            LoginError::Other(_)
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_unreadable_credential() {
        let authenticator = RingAuthenticator::new(ClientConfig::default());
        let result = authenticator
            .resume("not json", Arc::new(|_: &str| {}))
            .await;
        assert!(matches!(result, Err(LoginError::Rejected(_))));
    }
}
