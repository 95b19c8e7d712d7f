use std::path::PathBuf;

use async_trait::async_trait;
use nestcam_data::{Database, PredictionRecord};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Result, convert, models::Frame, sink::ResultSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    pub path_buf: PathBuf,
    pub database: PathBuf,
}

/// Keeps frames in a directory and prediction rows in sqlite.
pub struct LocalSink {
    config: Config,
    database: Database,
}

impl LocalSink {
    pub async fn new(config: Config) -> Result<Self> {
        let database = Database::new(&config.database).await?;
        Ok(Self { config, database })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl ResultSink for LocalSink {
    async fn put_frame(&self, frame: &Frame) -> Result<()> {
        let filename = frame.filename();
        let file_path = self.config.path_buf.join(&filename);

        tokio::fs::create_dir_all(&self.config.path_buf).await?;
        tokio::fs::copy(&frame.path, &file_path).await?;
        self.database
            .insert_frame(&convert::frame_record(frame, &file_path))
            .await?;
        tokio::fs::remove_file(&frame.path).await?;

        info!(filename, "Stored frame locally");
        Ok(())
    }

    async fn insert_prediction(&self, row: &PredictionRecord) -> Result<()> {
        self.database.insert_prediction(row).await?;
        Ok(())
    }

    async fn close(&self) {
        self.database.close().await;
    }
}
