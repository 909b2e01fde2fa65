//! Durable storage for Solace
//!
//! The cache and the write queue persist serialized records through the
//! [`DurableStore`] key-value surface. Multi-record changes go through
//! [`DurableStore::apply`], which is atomic.

mod connection;
mod memory;
mod migrations;
mod store;

use async_trait::async_trait;

use crate::error::Result;

pub use connection::Database;
pub use memory::MemoryStore;
pub use store::LibSqlStore;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Put { key: String, value: String },
    Delete { key: String },
}

impl StorageOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Process-restart-surviving key-value storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a single value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All `(key, value)` pairs whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Apply every operation or none of them.
    async fn apply(&self, batch: Vec<StorageOp>) -> Result<()>;

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.apply(vec![StorageOp::put(key, value)]).await
    }

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()> {
        self.apply(vec![StorageOp::delete(key)]).await
    }
}
