//! Local cache of journal entries.
//!
//! Records live under `cache/{user}/{entry id}` as serialized [`CacheRecord`]s,
//! with the last full synchronization time at `meta/{user}/last_sync`. Every
//! read-compare-write goes through one async lock, so the `updated_at` checks
//! hold across tasks.

use std::collections::HashSet;
use std::sync::Arc;

use crate::db::{DurableStore, StorageOp};
use crate::error::Result;
use crate::models::{CacheRecord, EntryId, JournalEntry, RecordSource};

pub(crate) fn record_prefix(user_id: &str) -> String {
    format!("cache/{user_id}/")
}

pub(crate) fn record_key(user_id: &str, entry_id: &EntryId) -> String {
    format!("cache/{user_id}/{}", entry_id.as_key())
}

fn last_sync_key(user_id: &str) -> String {
    format!("meta/{user_id}/last_sync")
}

/// Whether `candidate` may replace `existing`.
fn should_replace(
    existing: Option<&CacheRecord>,
    candidate: &JournalEntry,
    source: RecordSource,
) -> bool {
    match existing {
        Some(current) if current.is_server() => match source {
            RecordSource::Server => current.entry.updated_at <= candidate.updated_at,
            RecordSource::Cache => current.entry.updated_at < candidate.updated_at,
        },
        _ => true,
    }
}

pub struct LocalCache {
    store: Arc<dyn DurableStore>,
    write_lock: tokio::sync::Mutex<()>,
    max_records_per_user: usize,
}

impl LocalCache {
    pub fn new(store: Arc<dyn DurableStore>, max_records_per_user: usize) -> Self {
        Self {
            store,
            write_lock: tokio::sync::Mutex::new(()),
            max_records_per_user: max_records_per_user.max(1),
        }
    }

    pub async fn get(&self, user_id: &str, entry_id: &EntryId) -> Result<Option<CacheRecord>> {
        self.store
            .get(&record_key(user_id, entry_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    /// All records for `user_id`, most recently created first.
    pub async fn get_all(&self, user_id: &str) -> Result<Vec<CacheRecord>> {
        let mut records = self
            .store
            .scan_prefix(&record_prefix(user_id))
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str::<CacheRecord>(&raw))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.sort_by(|left, right| {
            right
                .entry
                .created_at
                .cmp(&left.entry.created_at)
                .then_with(|| right.entry.id.cmp(&left.entry.id))
        });
        Ok(records)
    }

    /// Write `entry` unless a newer server-confirmed record already exists.
    ///
    /// Returns whether the record was written.
    pub async fn put(
        &self,
        entry: &JournalEntry,
        source: RecordSource,
        synced_at: i64,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let existing = self.get(&entry.user_id, &entry.id).await?;
        if !should_replace(existing.as_ref(), entry, source) {
            tracing::debug!(
                "Keeping newer server record for {} over {:?} candidate",
                entry.id,
                source
            );
            return Ok(false);
        }

        let record = CacheRecord::new(entry.clone(), source, synced_at);
        self.store
            .put(
                &record_key(&entry.user_id, &entry.id),
                &serde_json::to_string(&record)?,
            )
            .await?;
        self.evict_overflow(&entry.user_id).await?;
        Ok(true)
    }

    /// Removing a missing record is not an error.
    pub async fn remove(&self, user_id: &str, entry_id: &EntryId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(&record_key(user_id, entry_id)).await
    }

    /// When `user_id`'s cache was last fully synchronized (Unix ms).
    pub async fn last_synced_at(&self, user_id: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .get(&last_sync_key(user_id))
            .await?
            .and_then(|raw| raw.trim().parse().ok()))
    }

    /// Forget the last synchronization time so the next read goes remote.
    pub async fn invalidate(&self, user_id: &str) -> Result<()> {
        self.store.delete(&last_sync_key(user_id)).await
    }

    /// Replace the user's server-confirmed records with a full remote listing.
    ///
    /// `requested_at` is when the fetch started. Server records missing from
    /// the listing are treated as deleted remotely unless they were written
    /// after the fetch started. Unacknowledged `cache` records are kept, as are
    /// local edits newer than the server copy.
    pub async fn apply_server_snapshot(
        &self,
        user_id: &str,
        entries: &[JournalEntry],
        requested_at: i64,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.get_all(user_id).await?;
        let mut ops = Vec::new();
        let mut listed = HashSet::new();

        for entry in entries.iter().filter(|entry| entry.user_id == user_id) {
            listed.insert(entry.id.clone());
            let current = existing.iter().find(|record| record.entry.id == entry.id);
            let keep_local = current.is_some_and(|record| {
                record.source == RecordSource::Cache
                    && record.entry.updated_at > entry.updated_at
            });
            if keep_local || !should_replace(current, entry, RecordSource::Server) {
                continue;
            }
            let record = CacheRecord::new(entry.clone(), RecordSource::Server, requested_at);
            ops.push(StorageOp::put(
                record_key(user_id, &entry.id),
                serde_json::to_string(&record)?,
            ));
        }

        let stale = existing
            .iter()
            .filter(|record| record.is_server() && !listed.contains(&record.entry.id))
            .filter(|record| record.synced_at <= requested_at);
        for record in stale {
            tracing::debug!("Dropping {} (deleted remotely)", record.entry.id);
            ops.push(StorageOp::delete(record_key(user_id, &record.entry.id)));
        }

        ops.push(StorageOp::put(last_sync_key(user_id), requested_at.to_string()));
        self.store.apply(ops).await?;
        self.evict_overflow(user_id).await
    }

    /// Op writing an unacknowledged local version of `entry`.
    pub fn optimistic_op(&self, entry: &JournalEntry, now: i64) -> Result<StorageOp> {
        let record = CacheRecord::new(entry.clone(), RecordSource::Cache, now);
        Ok(StorageOp::put(
            record_key(&entry.user_id, &entry.id),
            serde_json::to_string(&record)?,
        ))
    }

    /// Op writing a server-acknowledged version of `entry`.
    pub fn confirmed_op(&self, entry: &JournalEntry, now: i64) -> Result<StorageOp> {
        let record = CacheRecord::new(entry.clone(), RecordSource::Server, now);
        Ok(StorageOp::put(
            record_key(&entry.user_id, &entry.id),
            serde_json::to_string(&record)?,
        ))
    }

    /// Ops replacing the temporary record `temp_id` with its confirmed version.
    pub fn promotion_ops(
        &self,
        user_id: &str,
        temp_id: &EntryId,
        confirmed: &JournalEntry,
        now: i64,
    ) -> Result<Vec<StorageOp>> {
        let mut ops = Vec::with_capacity(2);
        if temp_id != &confirmed.id {
            ops.push(StorageOp::delete(record_key(user_id, temp_id)));
        }
        ops.push(self.confirmed_op(confirmed, now)?);
        Ok(ops)
    }

    pub fn remove_op(&self, user_id: &str, entry_id: &EntryId) -> StorageOp {
        StorageOp::delete(record_key(user_id, entry_id))
    }

    /// Evict the oldest-synced server records beyond the per-user bound.
    /// Unacknowledged records are never evicted.
    async fn evict_overflow(&self, user_id: &str) -> Result<()> {
        let records = self.get_all(user_id).await?;
        if records.len() <= self.max_records_per_user {
            return Ok(());
        }

        let overflow = records.len() - self.max_records_per_user;
        let mut evictable: Vec<&CacheRecord> =
            records.iter().filter(|record| record.is_server()).collect();
        evictable.sort_by_key(|record| (record.synced_at, record.entry.created_at));

        let ops: Vec<StorageOp> = evictable
            .into_iter()
            .take(overflow)
            .map(|record| StorageOp::delete(record_key(user_id, &record.entry.id)))
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        tracing::debug!("Evicting {} cached entries for {}", ops.len(), user_id);
        self.store.apply(ops).await
    }
}
