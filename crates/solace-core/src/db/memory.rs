//! In-process durable store stand-in.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{DurableStore, StorageOp};
use crate::error::{Error, Result};

/// Ordered in-memory map implementing [`DurableStore`].
///
/// Nothing survives the process; used for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent writes fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn apply(&self, batch: Vec<StorageOp>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated write failure".to_string()));
        }

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for op in batch {
            match op {
                StorageOp::Put { key, value } => {
                    records.insert(key, value);
                }
                StorageOp::Delete { key } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_batch_leaves_records_untouched() {
        let store = MemoryStore::new();
        store.put("a", "1").await.unwrap();
        let before = store.snapshot();

        store.set_fail_writes(true);
        let error = store
            .apply(vec![StorageOp::delete("a"), StorageOp::put("b", "2")])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Storage(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn scan_prefix_stops_at_prefix_boundary() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                StorageOp::put("cache/u1/a", "1"),
                StorageOp::put("cache/u2/a", "2"),
            ])
            .await
            .unwrap();
        let records = store.scan_prefix("cache/u1/").await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
