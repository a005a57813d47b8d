// src/state_manager.rs

use crate::models::JobRecord;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keeps finished job records in an SQLite file so they can still be looked up
/// after they are evicted from memory or the process restarts.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the history database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// In-memory database, used by tests.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS download_jobs (
                        job_id          TEXT PRIMARY KEY,
                        status          TEXT NOT NULL,
                        finished_at     INTEGER NOT NULL,
                        job_data        TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record for `job.job_id`.
    pub async fn save_job(&self, job: &JobRecord) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let job_id = job.job_id.to_string();
        let status = serde_json::to_value(job.status)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let finished_at = job.finished_at;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO download_jobs (job_id, status, finished_at, job_data)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![job_id, status, finished_at, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StateError> {
        let key = job_id.to_string();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT job_data FROM download_jobs WHERE job_id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recently finished jobs first.
    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StateError> {
        let limit = limit as i64;
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_data FROM download_jobs ORDER BY finished_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| row.get(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StateError::from))
            .collect()
    }
}
