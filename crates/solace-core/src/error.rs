//! Error types for solace-core

use thiserror::Error;

/// Result type alias using solace-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification the sync engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input. Never retried, never queued.
    ValidationFailed,
    /// No usable credential. Reads fall back to cache, writes are queued.
    AuthUnavailable,
    /// Network unreachable or timed out. Retryable.
    ConnectivityFailure,
    /// The server returned a definite business error. Not retried.
    RemoteRejected,
    /// Local durable I/O failed.
    StorageFailure,
    /// The referenced entry does not exist locally.
    NotFound,
}

/// Errors that can occur in solace-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// No usable credential
    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(String),

    /// Network failure or timeout
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    /// Definite rejection from the remote store
    #[error("Rejected by server: {0}")]
    RemoteRejected(String),

    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::AuthUnavailable(_) => ErrorKind::AuthUnavailable,
            Self::Connectivity(_) => ErrorKind::ConnectivityFailure,
            Self::RemoteRejected(_) => ErrorKind::RemoteRejected,
            Self::Storage(_) | Self::LibSql(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::StorageFailure
            }
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether a read may fall back to the cache and a write may be queued.
    pub const fn is_offline_condition(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AuthUnavailable | ErrorKind::ConnectivityFailure
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::RemoteRejected(format!("unexpected response payload: {error}"))
        } else {
            Self::Connectivity(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_variants_share_kind() {
        let io = Error::Io(std::io::Error::other("disk full"));
        assert_eq!(io.kind(), ErrorKind::StorageFailure);
        let json = serde_json::from_str::<u8>("nope").unwrap_err();
        assert_eq!(Error::from(json).kind(), ErrorKind::StorageFailure);
    }

    #[test]
    fn offline_conditions_are_auth_and_connectivity() {
        assert!(Error::Connectivity("timeout".into()).is_offline_condition());
        assert!(Error::AuthUnavailable("no session".into()).is_offline_condition());
        assert!(!Error::RemoteRejected("bad".into()).is_offline_condition());
        assert!(!Error::ValidationFailed("short".into()).is_offline_condition());
        assert!(!Error::Storage("locked".into()).is_offline_condition());
    }
}
