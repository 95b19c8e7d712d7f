use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Recording fetch failed: {0}")]
    Fetch(String),

    #[error("Frame sampling failed: {0}")]
    Sampling(String),

    #[error("Scoring failed: {0}")]
    Scoring(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Ring API error: {0}")]
    Ring(Box<ring_client::error::Error>),

    #[error("Database error: {0}")]
    Database(#[from] nestcam_data::error::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("General error: {0}")]
    General(String),
}

impl Error {
    /// Fatal errors end the run; everything else is logged and skipped per event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config(_))
    }
}

impl From<ring_client::error::Error> for Error {
    fn from(error: ring_client::error::Error) -> Self {
        match error {
            ring_client::error::Error::Auth(message) => Error::Auth(message),
            ring_client::error::Error::Requires2fa => {
                Error::Auth("two-factor code required".to_string())
            }
            other => Error::Ring(Box::new(other)),
        }
    }
}
