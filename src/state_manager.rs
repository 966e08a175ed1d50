// src/state_manager.rs

use crate::models::IndexRecord;
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

/// File name of the index database inside the cache directory.
pub const INDEX_FILE_NAME: &str = ".cache_index.sqlite3";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Persists which URL produced which cached file, so a restart can still
/// answer by URL and judge staleness.
#[derive(Clone)]
pub struct CacheIndex {
    conn: Connection,
}

impl CacheIndex {
    /// Opens (or creates) the index database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open(db_path).await?;
        let index = Self { conn };
        index.setup_database().await?;
        Ok(index)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory().await?;
        let index = Self { conn };
        index.setup_database().await?;
        Ok(index)
    }

    async fn setup_database(&self) -> Result<(), IndexError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS cache_index (
                        url             TEXT PRIMARY KEY,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record for its URL.
    pub async fn save_record(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let data = serde_json::to_string(record)?;
        let url = record.url.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_index (url, record) VALUES (?1, ?2)",
                    params![url, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All records; rows that no longer parse are skipped.
    pub async fn load_all(&self) -> Result<Vec<IndexRecord>, IndexError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT url, record FROM cache_index")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (url, data) in rows {
            match serde_json::from_str::<IndexRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Dropping unreadable index row");
                    self.delete_record(&url).await?;
                }
            }
        }
        Ok(records)
    }

    pub async fn delete_record(&self, url: &str) -> Result<(), IndexError> {
        let url = url.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM cache_index WHERE url = ?1", params![url])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
