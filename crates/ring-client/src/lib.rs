use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::{io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
    models::{Credential, Devices, HistoryEvent, RecordingUrl, Token},
};

pub mod config;
pub mod error;
pub mod models;

const OAUTH_CLIENT_ID: &str = "ring_official_android";
const OAUTH_SCOPE: &str = "client";
const API_VERSION: u32 = 11;

/// Invoked with the full credential every time a new token is issued.
pub type CredentialListener = Arc<dyn Fn(&Credential) + Send + Sync>;

pub struct RingClient {
    client: Client,
    api_url: Url,
    oauth_url: Url,
    config: ClientConfig,
    hardware_id: String,
    token: RwLock<Option<Token>>,
    listener: Option<CredentialListener>,
    closed: AtomicBool,
}

impl RingClient {
    /// A client with no token yet; call [`RingClient::login`] before anything else.
    pub fn new(config: ClientConfig, listener: Option<CredentialListener>) -> Result<Self> {
        Self::build(config, uuid::Uuid::new_v4().to_string(), None, listener)
    }

    /// A client resuming from a previously persisted credential.
    pub fn resume(
        config: ClientConfig,
        credential: Credential,
        listener: Option<CredentialListener>,
    ) -> Result<Self> {
        Self::build(
            config,
            credential.hardware_id,
            Some(credential.token),
            listener,
        )
    }

    fn build(
        config: ClientConfig,
        hardware_id: String,
        token: Option<Token>,
        listener: Option<CredentialListener>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;

        let api_url = Url::parse(&config.api_url)
            .map_err(|e| Error::General(format!("Invalid URL: {e}")))?;
        let oauth_url = Url::parse(&config.oauth_url)
            .map_err(|e| Error::General(format!("Invalid URL: {e}")))?;

        Ok(RingClient {
            client,
            api_url,
            oauth_url,
            config,
            hardware_id,
            token: RwLock::new(token),
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.token.read().await.clone().map(|token| Credential {
            token,
            hardware_id: self.hardware_id.clone(),
        })
    }

    /// Password grant. Returns [`Error::Requires2fa`] when the account demands a code
    /// and none (or a stale one) was supplied.
    pub async fn login(&self, username: &str, password: &str, otp: Option<&str>) -> Result<()> {
        self.ensure_open()?;

        let form = [
            ("client_id", OAUTH_CLIENT_ID),
            ("scope", OAUTH_SCOPE),
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];

        let response = self
            .client
            .post(self.oauth_url.clone())
            .header("2fa-support", "true")
            .header("2fa-code", otp.unwrap_or_default())
            .header("hardware_id", &self.hardware_id)
            .form(&form)
            .send()
            .await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => return Err(Error::Requires2fa),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::Auth(format!("Login failed: {}", response.status())));
            }
            status if !status.is_success() => {
                return Err(Error::Api {
                    status: status.as_u16(),
                    message: "token request failed".to_string(),
                });
            }
            _ => {}
        }

        let token: Token = response.json().await?;
        self.store_token(token).await;

        info!("Successfully logged in to Ring");
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let refresh_token = self
            .token
            .read()
            .await
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .ok_or_else(|| Error::Auth("No token to refresh".to_string()))?;

        let form = [
            ("client_id", OAUTH_CLIENT_ID),
            ("scope", OAUTH_SCOPE),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(self.oauth_url.clone())
            .header("2fa-support", "true")
            .header("hardware_id", &self.hardware_id)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(refresh_error(response.status()));
        }

        let token: Token = response.json().await?;
        self.store_token(token).await;

        debug!("Refreshed Ring access token");
        Ok(())
    }

    async fn store_token(&self, token: Token) {
        let token = token.stamped(Utc::now());
        *self.token.write().await = Some(token.clone());

        if let Some(listener) = &self.listener {
            listener(&Credential {
                token,
                hardware_id: self.hardware_id.clone(),
            });
        }
    }

    async fn add_headers(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let guard = self.token.read().await;
        let token = guard
            .as_ref()
            .ok_or_else(|| Error::Auth("Not logged in".to_string()))?;

        Ok(builder
            .bearer_auth(&token.access_token)
            .header("hardware_id", &self.hardware_id))
    }

    async fn token_expired(&self) -> bool {
        self.token
            .read()
            .await
            .as_ref()
            .is_some_and(|t| t.is_expired(Utc::now()))
    }

    /// Sends an authorized request, refreshing the token once on expiry or a 401.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.ensure_open()?;

        if self.token_expired().await {
            self.refresh().await?;
        }

        let response = self.add_headers(build(&self.client)).await?.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("Access token rejected, refreshing");
        self.refresh().await?;

        let response = self.add_headers(build(&self.client)).await?.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Auth("Request rejected after token refresh".to_string()));
        }
        Ok(response)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| Error::General(format!("Invalid URL: {e}")))
    }

    /// Registers this client's hardware id with the API. Rejection means the
    /// credential is no longer usable.
    pub async fn create_session(&self) -> Result<()> {
        let url = self.endpoint("/clients_api/session")?;
        let body = serde_json::json!({
            "device": {
                "hardware_id": self.hardware_id,
                "metadata": {
                    "api_version": API_VERSION,
                    "device_model": self.config.user_agent,
                },
                "os": "android",
            }
        });

        let response = self
            .send(|client| client.post(url.clone()).json(&body))
            .await?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "Session request failed: {}",
                response.status()
            )));
        }

        info!("Created Ring session");
        Ok(())
    }

    pub async fn devices(&self) -> Result<Devices> {
        let url = self.endpoint("/clients_api/ring_devices")?;
        let response = self.send(|client| client.get(url.clone())).await?;
        let response = check_status(response, "Device list request failed").await?;

        Ok(response.json().await?)
    }

    /// Most recent events first.
    pub async fn history(&self, device_id: &str, limit: usize) -> Result<Vec<HistoryEvent>> {
        let url = self.endpoint(&format!("/clients_api/doorbots/{device_id}/history"))?;
        let limit = limit.to_string();
        let response = self
            .send(|client| client.get(url.clone()).query(&[("limit", limit.as_str())]))
            .await?;
        let response = check_status(response, "History request failed").await?;

        Ok(response.json().await?)
    }

    async fn recording_url(&self, event_id: &str) -> Result<Url> {
        let url = self.endpoint(&format!("/clients_api/dings/{event_id}/recording"))?;
        let response = self
            .send(|client| {
                client
                    .get(url.clone())
                    .query(&[("disable_redirect", "true")])
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotReady(format!("no recording yet for {event_id}")));
        }
        let response = check_status(response, "Recording request failed").await?;

        let recording: RecordingUrl = response.json().await?;
        match recording.url.filter(|u| !u.is_empty()) {
            Some(u) => Url::parse(&u).map_err(|e| Error::General(format!("Invalid URL: {e}"))),
            None => Err(Error::NotReady(format!("recording for {event_id} is still processing"))),
        }
    }

    /// Streams the recording for `event_id` to `dest`, returning the byte count.
    /// Nothing is left at `dest` when the download fails.
    pub async fn download_recording(&self, event_id: &str, dest: &Path) -> Result<u64> {
        let url = self.recording_url(event_id).await?;

        let response = self.client.get(url).send().await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN
        ) {
            return Err(Error::NotReady(format!(
                "recording for {event_id} not published yet: {}",
                response.status()
            )));
        }
        let response = check_status(response, "Video download failed").await?;

        let partial = dest.with_extension("part");
        let written = match write_stream(response, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial)
                    .await
                    .inspect_err(|err| warn!(err = ?err, "Failed to remove partial download"));
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, dest).await?;

        debug!(event_id, bytes = written, "Downloaded recording");
        Ok(written)
    }

    /// Marks the client closed; every later call fails with [`Error::Closed`].
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closed Ring session");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

/// Only a rejected refresh token means the credential is bad. Throttling and
/// server errors are worth another try on the next call.
fn refresh_error(status: StatusCode) -> Error {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("Token refresh failed: {status}"))
        }
        status => Error::Api {
            status: status.as_u16(),
            message: "token refresh failed".to_string(),
        },
    }
}

async fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message: format!("{context}: {body}"),
    })
}

async fn write_stream(response: Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}
