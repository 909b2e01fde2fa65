//! solace-core - Core library for Solace
//!
//! This crate contains the journal models, durable storage, session lifecycle
//! and the offline-first sync engine used by Solace clients.

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod session;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, SyncSettings};
pub use error::{Error, ErrorKind, Result};
pub use models::{EntryDraft, EntryId, JournalEntry};
pub use queue::{DrainMode, DrainReport};
pub use session::{SessionPhase, SessionSnapshot, SessionStore};
pub use state::SyncState;
pub use sync::{CreateOutcome, EntriesResult, SyncEngine};
