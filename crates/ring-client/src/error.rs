use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Two-factor authentication code required")]
    Requires2fa,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error: {status} {message}")]
    Api { status: u16, message: String },

    #[error("Recording not ready: {0}")]
    NotReady(String),

    #[error("Session closed")]
    Closed,

    #[error("General error: {0}")]
    General(String),
}

impl Error {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Io(_) | Error::NotReady(_) => true,
            Error::Api { status, .. } => *status == 404 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
