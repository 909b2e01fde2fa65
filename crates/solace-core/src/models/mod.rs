//! Data models for Solace

mod cache_record;
mod entry;
mod queued_write;

pub use cache_record::{CacheRecord, RecordSource};
pub use entry::{
    EntryDraft, EntryId, JournalEntry, MAX_CONTENT_CHARS, MAX_LIST_ITEMS, MAX_LIST_ITEM_CHARS,
    MAX_RATING, MIN_CONTENT_CHARS, MIN_RATING,
};
pub use queued_write::{new_idempotency_key, DeadLetter, QueuedWrite, WriteKind};
