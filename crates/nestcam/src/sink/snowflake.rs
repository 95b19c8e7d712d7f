use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use nestcam_data::PredictionRecord;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, trace};

use crate::{
    Error, Result,
    config::{env_var, opt_from_file_const_or_env},
    models::Frame,
    sink::ResultSink,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    #[serde(default = "default_account")]
    pub account: Option<String>,
    #[serde(default = "default_user")]
    pub user: Option<String>,
    #[serde(default = "default_password", deserialize_with = "opt_from_file_const_or_env")]
    pub password: Option<String>,
    /// e.g. `externalbrowser`; when set the password is not used.
    #[serde(default = "default_authenticator")]
    pub authenticator: Option<String>,
    #[serde(default = "default_warehouse")]
    pub warehouse: Option<String>,
    #[serde(default = "default_database")]
    pub database: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_stage")]
    pub stage: Option<String>,
    #[serde(default = "default_table")]
    pub table: Option<String>,
    #[serde(default = "default_snowsql_path")]
    pub snowsql_path: String,
}

fn default_account() -> Option<String> {
    env_var("SNOWFLAKE_ACCOUNT")
}

fn default_user() -> Option<String> {
    env_var("SNOWFLAKE_USER")
}

fn default_password() -> Option<String> {
    env_var("SNOWFLAKE_PASSWORD")
}

fn default_authenticator() -> Option<String> {
    env_var("SNOWFLAKE_AUTHENTICATOR")
}

fn default_warehouse() -> Option<String> {
    env_var("SNOWFLAKE_WAREHOUSE")
}

fn default_database() -> Option<String> {
    env_var("SNOWFLAKE_DATABASE")
}

fn default_schema() -> Option<String> {
    env_var("SNOWFLAKE_SCHEMA")
}

fn default_stage() -> Option<String> {
    env_var("SNOWFLAKE_IMAGE_STAGE")
}

fn default_table() -> Option<String> {
    env_var("SNOWFLAKE_INFERENCE_TABLE")
}

fn default_snowsql_path() -> String {
    "snowsql".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: default_account(),
            user: default_user(),
            password: default_password(),
            authenticator: default_authenticator(),
            warehouse: default_warehouse(),
            database: default_database(),
            schema: default_schema(),
            role: None,
            stage: default_stage(),
            table: default_table(),
            snowsql_path: default_snowsql_path(),
        }
    }
}

pub struct SnowflakeSink {
    config: Config,
}

impl SnowflakeSink {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn connection_args(&self) -> Result<Vec<String>> {
        let account = required(&self.config.account, "account")?;
        let user = required(&self.config.user, "user")?;

        let mut args = vec![
            "-a".to_string(),
            account.to_string(),
            "-u".to_string(),
            user.to_string(),
            "-o".to_string(),
            "exit_on_error=true".to_string(),
            "-o".to_string(),
            "friendly=false".to_string(),
            "-o".to_string(),
            "quiet=true".to_string(),
        ];

        for (flag, value) in [
            ("-w", &self.config.warehouse),
            ("-d", &self.config.database),
            ("-s", &self.config.schema),
            ("-r", &self.config.role),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }

        if let Some(authenticator) = &self.config.authenticator {
            args.push("--authenticator".to_string());
            args.push(authenticator.clone());
        }

        Ok(args)
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut command = Command::new(&self.config.snowsql_path);
        command
            .args(self.connection_args()?)
            .arg("-q")
            .arg(statement)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.config.authenticator.is_none() {
            command.env("SNOWSQL_PWD", required(&self.config.password, "password")?);
        }

        debug!(statement, "Executing Snowflake statement");
        let output = command
            .output()
            .await
            .map_err(|e| Error::Sink(format!("Failed to execute snowsql: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Sink(format!("snowsql failed: {stderr}")));
        }

        trace!("snowsql output: {}", String::from_utf8_lossy(&output.stdout));
        Ok(())
    }
}

#[async_trait]
impl ResultSink for SnowflakeSink {
    #[tracing::instrument(skip(self, frame), fields(frame = %frame.filename()))]
    async fn put_frame(&self, frame: &Frame) -> Result<()> {
        let stage = required(&self.config.stage, "stage")?;

        self.execute(&put_statement(&frame.path, stage)).await?;
        tokio::fs::remove_file(&frame.path).await?;

        info!(stage, "Uploaded frame to Snowflake stage");
        Ok(())
    }

    async fn insert_prediction(&self, row: &PredictionRecord) -> Result<()> {
        let table = required(&self.config.table, "table")?;

        self.execute(&insert_statement(table, row)).await?;

        debug!(id = row.id, table, "Inserted prediction");
        Ok(())
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Config(format!("Snowflake {name} is not configured")))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn put_statement(path: &Path, stage: &str) -> String {
    format!(
        "PUT {} @{stage} AUTO_COMPRESS=FALSE",
        quote(&format!("file://{}", path.display()))
    )
}

pub fn insert_statement(table: &str, row: &PredictionRecord) -> String {
    let at = row.captured_at;
    format!(
        "INSERT INTO {table} (filename, endpoint_id, DT_year, DT_month, DT_day, DT_hour, DT_minute, DT_second, \
         label_name, label_index, confidence, bboxes, id, event_id) \
         SELECT {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, PARSE_JSON({}), {}, {}",
        quote(&row.filename),
        quote(&row.endpoint_id),
        at.year(),
        at.month(),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        quote(&row.label_name),
        row.label_index,
        row.confidence,
        quote(&row.bboxes),
        quote(&row.id),
        quote(&row.event_id),
    )
}
