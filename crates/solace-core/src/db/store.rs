//! libSQL-backed durable store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Database, DurableStore, StorageOp};
use crate::error::Result;

/// Thread-safe key-value store over a single libSQL connection.
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Mutex<Database>>,
}

impl LibSqlStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

#[async_trait]
impl DurableStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT value FROM kv_records WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get::<String>(0)?))
        } else {
            Ok(None)
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let upper = format!("{prefix}{}", char::MAX);
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT key, value FROM kv_records WHERE key >= ? AND key < ? ORDER BY key",
                [prefix, upper.as_str()],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push((row.get::<String>(0)?, row.get::<String>(1)?));
        }
        Ok(records)
    }

    async fn apply(&self, batch: Vec<StorageOp>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        for op in &batch {
            match op {
                StorageOp::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv_records (key, value) VALUES (?, ?)",
                        [key.as_str(), value.as_str()],
                    )
                    .await?;
                }
                StorageOp::Delete { key } => {
                    tx.execute("DELETE FROM kv_records WHERE key = ?", [key.as_str()])
                        .await?;
                }
            }
        }
        tx.commit().await?;
        tracing::trace!("Committed {} storage operations", batch.len());
        Ok(())
    }
}
