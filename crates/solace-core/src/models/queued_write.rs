//! Pending write model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntryId, JournalEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Create,
    Update,
}

/// A create/update that has not been acknowledged by the server yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWrite {
    /// FIFO position, assigned on enqueue
    #[serde(default)]
    pub seq: u64,
    pub kind: WriteKind,
    /// Full payload; `entry.id` is the write's target
    pub entry: JournalEntry,
    pub user_id: String,
    /// Sent verbatim on every attempt so the server can deduplicate
    pub idempotency_key: String,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time a scheduled drain may send this write again (Unix ms)
    #[serde(default)]
    pub next_attempt_at: i64,
}

impl QueuedWrite {
    #[must_use]
    pub fn create(entry: JournalEntry, idempotency_key: Option<String>, now: i64) -> Self {
        Self::new(WriteKind::Create, entry, idempotency_key, now)
    }

    #[must_use]
    pub fn update(entry: JournalEntry, idempotency_key: Option<String>, now: i64) -> Self {
        Self::new(WriteKind::Update, entry, idempotency_key, now)
    }

    fn new(kind: WriteKind, entry: JournalEntry, idempotency_key: Option<String>, now: i64) -> Self {
        Self {
            seq: 0,
            kind,
            user_id: entry.user_id.clone(),
            entry,
            idempotency_key: idempotency_key.unwrap_or_default(),
            created_at: now,
            attempts: 0,
            last_error: None,
            next_attempt_at: 0,
        }
    }

    pub const fn target(&self) -> &EntryId {
        &self.entry.id
    }

    pub const fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Generate a fresh idempotency key for one logical write intent.
#[must_use]
pub fn new_idempotency_key() -> String {
    Uuid::new_v4().to_string()
}

/// A write that will not be retried automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub write: QueuedWrite,
    /// Unix ms
    pub failed_at: i64,
    pub reason: String,
    /// True when the server rejected the write; false when retries ran out
    pub rejected: bool,
}
