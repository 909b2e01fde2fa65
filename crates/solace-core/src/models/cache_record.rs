//! Cache record model

use serde::{Deserialize, Serialize};

use super::JournalEntry;

/// Where a cached entry's current value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// Confirmed by the remote store
    Server,
    /// Written locally and not yet acknowledged
    Cache,
}

/// A journal entry as held by the local cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub entry: JournalEntry,
    /// When the record was last written from a server response (Unix ms)
    pub synced_at: i64,
    pub source: RecordSource,
}

impl CacheRecord {
    pub const fn new(entry: JournalEntry, source: RecordSource, synced_at: i64) -> Self {
        Self {
            entry,
            synced_at,
            source,
        }
    }

    pub const fn is_server(&self) -> bool {
        matches!(self.source, RecordSource::Server)
    }
}
