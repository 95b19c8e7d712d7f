use std::{
    io::{self, Write},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    camera::{Authenticator, CameraApi, CredentialCallback, LoginError},
    config::RingConfig,
    credentials::CredentialStore,
    models::{Device, DeviceKind},
};

/// Supplies a one-time second-factor code when the upstream demands one.
#[async_trait]
pub trait OtpPrompt: Send + Sync {
    async fn second_factor(&self) -> Result<String>;
}

pub struct StdinOtpPrompt;

#[async_trait]
impl OtpPrompt for StdinOtpPrompt {
    async fn second_factor(&self) -> Result<String> {
        tokio::task::spawn_blocking(|| -> Result<String> {
            print!("2FA code: ");
            io::stdout().flush().map_err(|e| {
                io::Error::new(e.kind(), format!("Failed to flush stdout: {e}"))
            })?;

            let mut input = String::new();
            io::stdin()
                .read_line(&mut input)
                .map_err(|e| io::Error::new(e.kind(), format!("Failed to read input: {e}")))?;
            Ok(input.trim().to_string())
        })
        .await
        .map_err(|e| Error::General(format!("OTP prompt task failed: {e}")))?
    }
}

/// An authenticated upstream plus the device list captured at login.
pub struct Session {
    api: Arc<dyn CameraApi>,
    devices: Vec<Device>,
}

impl Session {
    pub fn new(api: Arc<dyn CameraApi>, devices: Vec<Device>) -> Self {
        Self { api, devices }
    }

    pub fn api(&self) -> &dyn CameraApi {
        self.api.as_ref()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Finds the named camera, falling back to the first camera when the name
    /// matches nothing. Only cameras are considered.
    pub fn resolve_device(&self, name: &str) -> Option<&Device> {
        let mut cameras = self
            .devices
            .iter()
            .filter(|device| device.kind == DeviceKind::Camera);

        let first = cameras.clone().next()?;
        if let Some(device) = cameras.find(|device| device.name == name) {
            return Some(device);
        }

        warn!(
            device_name = name,
            fallback = first.name,
            "No camera with that name, using the first camera instead"
        );
        Some(first)
    }
}

pub struct SessionManager {
    config: RingConfig,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn CredentialStore>,
    otp: Arc<dyn OtpPrompt>,
}

impl SessionManager {
    pub fn new(
        config: RingConfig,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn CredentialStore>,
        otp: Arc<dyn OtpPrompt>,
    ) -> Self {
        Self {
            config,
            authenticator,
            store,
            otp,
        }
    }

    /// Resumes from the cached credential when possible, otherwise logs in
    /// with the configured username and password.
    pub async fn acquire(&self) -> Result<Session> {
        let api = self.authenticate().await?;

        let devices = match api.devices().await {
            Ok(devices) => devices,
            Err(err) => {
                api.close().await;
                return Err(err);
            }
        };

        info!(devices = devices.len(), "Ring session established");
        Ok(Session::new(api, devices))
    }

    pub async fn release(&self, session: Session) {
        session.api.close().await;
    }

    async fn authenticate(&self) -> Result<Arc<dyn CameraApi>> {
        if let Some(cached) = self.cached_credential() {
            match self
                .authenticator
                .resume(&cached, self.persist_callback())
                .await
            {
                Ok(api) => {
                    info!("Resumed session from cached credential");
                    return Ok(api);
                }
                Err(LoginError::Other(err)) => return Err(err),
                Err(err) => {
                    warn!(err = %err, "Cached credential rejected, logging in again");
                }
            }
        }

        self.login().await
    }

    async fn login(&self) -> Result<Arc<dyn CameraApi>> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or_else(|| Error::Auth("Ring username is not configured".to_string()))?;
        let password = self
            .config
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Ring password is not configured".to_string()))?;

        let first = self
            .authenticator
            .login(username, password, None, self.persist_callback())
            .await;

        let result = match first {
            Err(LoginError::SecondFactorRequired) => {
                info!("Ring account requires a second factor");
                let code = self.otp.second_factor().await?;
                self.authenticator
                    .login(username, password, Some(&code), self.persist_callback())
                    .await
            }
            other => other,
        };

        result.map_err(|err| match err {
            LoginError::Other(err) => err,
            LoginError::SecondFactorRequired => {
                Error::Auth("second factor was not accepted".to_string())
            }
            LoginError::Rejected(message) => Error::Auth(message),
        })
    }

    fn cached_credential(&self) -> Option<String> {
        self.store
            .load(&self.config.user_agent)
            .inspect_err(|err| warn!(err = ?err, "Failed to read cached credential"))
            .ok()
            .flatten()
    }

    fn persist_callback(&self) -> CredentialCallback {
        let store = self.store.clone();
        let key = self.config.user_agent.clone();

        Arc::new(move |credential: &str| match store.store(&key, credential) {
            Ok(()) => debug!("Persisted credential"),
            Err(err) => warn!(err = ?err, "Failed to persist credential"),
        })
    }
}
