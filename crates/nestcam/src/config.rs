use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use ring_client::config::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Result, fetcher::RetryPolicy, logging, metrics, scoring, sink};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scoring: scoring::Config,
    #[serde(default)]
    pub sink: sink::Config,
    #[serde(default)]
    pub dedup: Option<DedupConfig>,
    #[serde(default)]
    pub logging: Option<logging::Config>,
    #[serde(default)]
    pub metrics: Option<metrics::Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct RingConfig {
    #[serde(default = "default_username", deserialize_with = "opt_from_file_const_or_env")]
    pub username: Option<String>,
    #[serde(default = "default_password", deserialize_with = "opt_from_file_const_or_env")]
    pub password: Option<String>,
    /// Sent to Ring and used as the credential cache key.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "nestcam_home")]
    pub credential_dir: PathBuf,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_oauth_url")]
    pub oauth_url: String,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub timeout: Duration,
}

fn default_username() -> Option<String> {
    env_var("RING_USERNAME")
}

fn default_password() -> Option<String> {
    env_var("RING_PASSWORD")
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

fn default_api_url() -> String {
    ClientConfig::default().api_url
}

fn default_oauth_url() -> String {
    ClientConfig::default().oauth_url
}

fn default_request_timeout() -> Duration {
    ClientConfig::default().timeout
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
            user_agent: default_user_agent(),
            credential_dir: nestcam_home(),
            api_url: default_api_url(),
            oauth_url: default_oauth_url(),
            timeout: default_request_timeout(),
        }
    }
}

impl RingConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            user_agent: self.user_agent.clone(),
            api_url: self.api_url.clone(),
            oauth_url: self.oauth_url.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct PipelineConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde", default = "default_batch_pacing")]
    pub batch_pacing: Duration,
    /// Batch window when `--minutes` is not given.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_recording_dir")]
    pub recording_dir: PathBuf,
    #[serde(default = "default_frame_dir")]
    pub frame_dir: PathBuf,
    #[serde(with = "humantime_serde", default = "default_frame_interval")]
    pub frame_interval: Duration,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_pacing() -> Duration {
    Duration::from_secs(2)
}

fn default_window_minutes() -> u64 {
    60
}

fn default_history_limit() -> usize {
    100
}

fn default_recording_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_frame_dir() -> PathBuf {
    PathBuf::from("data/snapshots")
}

fn default_frame_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            cooldown: default_cooldown(),
            batch_pacing: default_batch_pacing(),
            window_minutes: default_window_minutes(),
            history_limit: default_history_limit(),
            recording_dir: default_recording_dir(),
            frame_dir: default_frame_dir(),
            frame_interval: default_frame_interval(),
            ffmpeg_path: default_ffmpeg_path(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Presence of `[dedup]` turns the processed-event ledger on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct DedupConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    nestcam_home().join("events.db")
}

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args<T: serde::de::DeserializeOwned + Default + Clone + Send + Sync + 'static> {
    #[arg(short, long, env, value_parser = toml_from_file::<T>)]
    pub config: Option<T>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Poll for new events and process each one as it arrives
    Run(TargetArgs),
    /// Score and upload every event from the last N minutes
    Process(TargetArgs),
    /// Upload frames from every event in the last N minutes, without scoring
    Collect(TargetArgs),
    /// Interactively create a configuration file
    Init,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    #[arg(short, long, env = "NESTCAM_DEVICE_NAME", default_value = "Front Door")]
    pub device_name: String,
    /// Defaults to the configured window for batch commands and to no catch-up for `run`
    #[arg(short, long)]
    pub minutes: Option<u64>,
}

impl<T: serde::de::DeserializeOwned + Default + Clone + Send + Sync + 'static> Args<T> {
    pub fn get_config(&self) -> Result<T> {
        if let Some(config) = &self.config {
            return Ok(config.clone());
        }

        let default_path = default_config_path();
        if Path::new(&default_path).exists() {
            toml_from_file(&default_path)
        } else {
            Ok(T::default())
        }
    }
}

pub fn nestcam_home() -> PathBuf {
    std::env::var("HOME")
        .map(|home| Path::new(&home).join(".nestcam"))
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub fn default_config_path() -> String {
    nestcam_home().join("config.toml").display().to_string()
}

pub fn toml_from_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let toml = std::fs::read_to_string(path)?;
    toml_from_str(&toml)
}

pub fn toml_from_str<T: serde::de::DeserializeOwned>(toml: &str) -> Result<T> {
    let config_json: serde_json::Value = toml::from_str(toml)?;
    let config = serde_json::from_value(config_json)?;
    Ok(config)
}

/// Non-empty environment variable.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Resolves `file:PATH` and `env:VAR` indirection. An unset or empty variable
/// resolves to `None`, leaving the stage that needs the value to report it.
pub fn opt_from_file_const_or_env<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    if let Some(path) = s.strip_prefix("file:") {
        std::fs::read_to_string(path)
            .map(|contents| Some(contents.trim_end().to_string()))
            .map_err(serde::de::Error::custom)
    } else if let Some(name) = s.strip_prefix("env:") {
        let value = env_var(name);
        if value.is_none() {
            debug!(variable = name, "Environment variable is not set");
        }
        Ok(value)
    } else {
        Ok(Some(s))
    }
}

pub async fn check_and_create_config() -> Result<()> {
    let config_dir = nestcam_home();
    let config_path = config_dir.join("config.toml");

    if config_path.exists() {
        info!("Configuration file already exists at: {}", config_path.display());
        return Ok(());
    }

    info!("Setting up initial configuration...");

    fs::create_dir_all(&config_dir).map_err(|e| {
        io::Error::new(e.kind(), format!("Failed to create config directory: {e}"))
    })?;

    let config_content = prompt_for_config()?;
    fs::write(&config_path, config_content)
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to write config file: {e}")))?;

    info!("Configuration file created at: {}", config_path.display());
    Ok(())
}

fn prompt_for_config() -> Result<String> {
    println!("Welcome to nestcam setup!");
    println!("Press Enter to use default values shown in brackets.\n");

    let username = prompt_with_default("Ring username", "env:RING_USERNAME")?;
    let password = prompt_with_default("Ring password", "env:RING_PASSWORD")?;
    let poll_interval = prompt_with_default("Poll interval (e.g., 5s)", "5s")?;
    let window_minutes = prompt_with_default("Batch window in minutes", "60")?;

    println!("\nScoring (LandingLens):");
    let app_url = prompt_with_default("Inference app URL", "https://predict.app.landing.ai")?;
    let endpoint_id = prompt_with_default("Endpoint id", "")?;
    let api_key = prompt_with_default("API key", "env:LANDINGLENS_API_KEY")?;

    println!("\nSelect a result sink:");
    println!("1. Snowflake");
    println!("2. Local directory + sqlite");
    let sink = match prompt_with_default("Sink", "1")?.trim() {
        "2" | "local" => {
            let path_buf = prompt_with_default("Frame directory", "./data/frames")?;
            let database = prompt_with_default("Results database", "./data/nestcam.db")?;
            format!("[sink.local]\npath-buf = \"{path_buf}\"\ndatabase = \"{database}\"")
        }
        _ => prompt_for_snowflake_config()?,
    };

    let endpoint_line = if endpoint_id.is_empty() {
        "".to_string()
    } else {
        format!("\nendpoint-id = \"{endpoint_id}\"")
    };

    let config = format!(
        r#"[ring]
username = "{username}"
password = "{password}"

[pipeline]
poll-interval = "{poll_interval}"
window-minutes = {window_minutes}

[scoring]
app-url = "{app_url}"
api-key = "{api_key}"{endpoint_line}

{sink}
"#
    );

    Ok(config)
}

fn prompt_for_snowflake_config() -> Result<String> {
    println!("\nConfiguring Snowflake...");

    let account = prompt_with_default("Account", "")?;
    let user = prompt_with_default("User", "")?;
    let authenticator =
        prompt_with_default("Authenticator (blank for password, or externalbrowser)", "")?;
    let warehouse = prompt_with_default("Warehouse", "COMPUTE_WH")?;
    let database = prompt_with_default("Database", "NESTCAM")?;
    let schema = prompt_with_default("Schema", "PUBLIC")?;
    let stage = prompt_with_default("Image stage", "frames")?;
    let table = prompt_with_default("Inference table", "inference")?;

    let auth_line = if authenticator.is_empty() {
        "password = \"env:SNOWFLAKE_PASSWORD\"".to_string()
    } else {
        format!("authenticator = \"{authenticator}\"")
    };

    Ok(format!(
        r#"[sink.snowflake]
account = "{account}"
user = "{user}"
{auth_line}
warehouse = "{warehouse}"
database = "{database}"
schema = "{schema}"
stage = "{stage}"
table = "{table}""#
    ))
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    print!("{prompt} [{default}]: ");
    io::stdout()
        .flush()
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to flush stdout: {e}")))?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to read input: {e}")))?;

    let input = input.trim();
    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input.to_string())
    }
}
