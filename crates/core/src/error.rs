//! Unified storage error types for stow.
//!
//! Every failure raised by a storage backend, the storage adapter or while decoding
//! persisted cache metadata is expressed as an [`Error`]. The client crate wraps these
//! into its `CacheError` category.

use tokio_rusqlite::rusqlite;

/// Unified error type for storage and cache metadata failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// An entry could not be encoded or decoded.
    #[error("CACHE_ERROR: serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored entry is malformed (bad headers, unreadable policy metadata).
    #[error("CACHE_ERROR: invalid entry: {0}")]
    InvalidEntry(String),

    /// A TTL was supplied but is not a positive duration.
    #[error("CACHE_ERROR: ttl must be positive")]
    InvalidTtl,

    /// A custom backend reported a failure.
    #[error("CACHE_ERROR: {0}")]
    Backend(String),
}

impl Error {
    /// Wrap an arbitrary backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}
