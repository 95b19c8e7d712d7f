use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    Row, SqlitePool,
    migrate::MigrateDatabase,
    sqlite::{SqlitePoolOptions, SqliteRow},
};
use tracing::debug;

pub mod error;

use crate::error::{Error, Result};

/// A still image that has been copied into local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameRecord {
    pub filename: String,
    pub event_id: String,
    pub captured_at: DateTime<Utc>,
    pub stored_path: String,
}

/// One prediction for one frame. `id` is assigned by the scoring endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    pub id: String,
    pub filename: String,
    pub endpoint_id: String,
    pub captured_at: DateTime<Utc>,
    pub label_name: String,
    pub label_index: i64,
    pub confidence: f64,
    pub bboxes: String,
    pub event_id: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        if !sqlx::Sqlite::database_exists(&db_path.to_string_lossy()).await? {
            sqlx::Sqlite::create_database(&db_path.to_string_lossy()).await?;
        }

        let database_url = format!("sqlite:{}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Self::init(pool).await
    }

    /// A private database that lives as long as this handle.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frames (
                filename TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                stored_path TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                endpoint_id TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                label_name TEXT NOT NULL,
                label_index INTEGER NOT NULL,
                confidence REAL NOT NULL,
                bboxes TEXT NOT NULL,
                event_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                processed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Local database ready");
        Ok(Database { pool })
    }

    pub async fn insert_frame(&self, frame: &FrameRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO frames (filename, event_id, captured_at, stored_path)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&frame.filename)
        .bind(&frame.event_id)
        .bind(frame.captured_at.timestamp())
        .bind(&frame.stored_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upserts on the prediction id, so replaying an event does not duplicate rows.
    pub async fn insert_prediction(&self, prediction: &PredictionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO predictions (
                id, filename, endpoint_id, captured_at, label_name, label_index,
                confidence, bboxes, event_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&prediction.id)
        .bind(&prediction.filename)
        .bind(&prediction.endpoint_id)
        .bind(prediction.captured_at.timestamp())
        .bind(&prediction.label_name)
        .bind(prediction.label_index)
        .bind(prediction.confidence)
        .bind(&prediction.bboxes)
        .bind(&prediction.event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn frames_for_event(&self, event_id: &str) -> Result<Vec<FrameRecord>> {
        let rows = sqlx::query("SELECT * FROM frames WHERE event_id = ? ORDER BY filename")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(FrameRecord {
                    filename: row.get("filename"),
                    event_id: row.get("event_id"),
                    captured_at: timestamp(row, "captured_at")?,
                    stored_path: row.get("stored_path"),
                })
            })
            .collect()
    }

    pub async fn predictions_for_event(&self, event_id: &str) -> Result<Vec<PredictionRecord>> {
        let rows = sqlx::query("SELECT * FROM predictions WHERE event_id = ? ORDER BY id")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PredictionRecord {
                    id: row.get("id"),
                    filename: row.get("filename"),
                    endpoint_id: row.get("endpoint_id"),
                    captured_at: timestamp(row, "captured_at")?,
                    label_name: row.get("label_name"),
                    label_index: row.get("label_index"),
                    confidence: row.get("confidence"),
                    bboxes: row.get("bboxes"),
                    event_id: row.get("event_id"),
                })
            })
            .collect()
    }

    pub async fn mark_event_processed(&self, event_id: &str, device_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO processed_events (event_id, device_id, processed_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(event_id)
        .bind(device_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM processed_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = row.get(column);
    DateTime::from_timestamp(secs, 0).ok_or(Error::InvalidTimestamp(secs))
}
