//! Sync status shown next to the entry list.

use std::fmt;

/// Coarse sync state for status badges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// The server was unreachable, or writes are waiting to be sent
    Offline,
    Syncing,
    Synced,
    /// The last pass dead-lettered a write or hit a storage error
    Error,
}

impl SyncState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
