use std::sync::Arc;

use async_trait::async_trait;
use nestcam_data::PredictionRecord;
use serde::{Deserialize, Serialize};

use crate::{Result, models::Frame};

pub mod local;
pub mod snowflake;

/// Where frames and prediction rows end up.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Uploads the image. The local file is removed only after a successful upload.
    async fn put_frame(&self, frame: &Frame) -> Result<()>;

    async fn insert_prediction(&self, row: &PredictionRecord) -> Result<()>;

    async fn close(&self) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub enum Config {
    Snowflake(snowflake::Config),
    Local(local::Config),
}

impl Default for Config {
    fn default() -> Self {
        Config::Snowflake(snowflake::Config::default())
    }
}

pub async fn sink_target(config: &Config) -> Result<Arc<dyn ResultSink>> {
    Ok(match config {
        Config::Snowflake(config) => {
            Arc::new(snowflake::SnowflakeSink::new(config.clone())) as Arc<dyn ResultSink>
        }
        Config::Local(config) => {
            Arc::new(local::LocalSink::new(config.clone()).await?) as Arc<dyn ResultSink>
        }
    })
}
