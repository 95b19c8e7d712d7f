use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result, config::opt_from_file_const_or_env};

const DEFAULT_FILTER: &str = "info,sqlx=warn,reqwest=warn,hyper=warn";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    pub loki: Option<LokiConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct LokiConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "opt_from_file_const_or_env")]
    pub password: Option<String>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

pub fn init_logging(logging_config: Option<Config>) -> Result<()> {
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)));

    if let Some(loki_config) = logging_config.and_then(|logging_config| logging_config.loki) {
        let (loki_layer, task) = create_loki_layer(loki_config)?;
        registry.with(loki_layer).init();
        tokio::spawn(task);
    } else {
        registry.init();
    }

    Ok(())
}

fn create_loki_layer(
    loki_config: LokiConfig,
) -> Result<(tracing_loki::Layer, tracing_loki::BackgroundTask)> {
    let url = loki_config
        .url
        .parse()
        .map_err(|e| Error::Logging(format!("Invalid Loki URL: {e}")))?;

    let mut labels = HashMap::new();
    labels.insert("service".to_string(), env!("CARGO_PKG_NAME").to_string());
    labels.extend(loki_config.labels.unwrap_or_default());

    let mut extra_fields = HashMap::new();
    if let Some(auth_header) = basic_auth(loki_config.username, loki_config.password) {
        extra_fields.insert("Authorization".to_string(), auth_header);
    }

    tracing_loki::layer(url, labels, extra_fields)
        .map_err(|e| Error::Logging(format!("Failed to create Loki layer: {e}")))
}

fn basic_auth(username: Option<String>, password: Option<String>) -> Option<String> {
    let (username, password) = username.zip(password)?;
    Some(format!(
        "Basic {}",
        base64::prelude::BASE64_STANDARD.encode(format!("{username}:{password}"))
    ))
}
