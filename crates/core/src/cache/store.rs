//! Storage backend contract and the adapter the orchestrator talks to.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CacheEntry, CacheKey, MemoryStore, SqliteStore};
use crate::{CacheConfig, Error};

/// Asynchronous key-value contract implemented by storage backends.
///
/// Implementations must be safe for concurrent use on independent keys. A `ttl`,
/// when given, bounds how long the backend may return the entry.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error>;

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// Uniform handle over a storage backend.
///
/// Performs no retries: every backend failure is returned to the caller, which
/// alone decides on recovery.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(backend: impl StorageBackend) -> Self {
        Self { backend: Arc::new(backend) }
    }

    /// Fresh in-process map backend.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Build the backend named by the configuration: SQLite when `db_path` is set,
    /// the in-process map otherwise.
    pub async fn open(config: &CacheConfig) -> Result<Self, Error> {
        match &config.db_path {
            Some(path) => {
                tracing::debug!("opening sqlite cache at {}", path.display());
                Ok(Self::new(SqliteStore::open(path).await?))
            }
            None => Ok(Self::in_memory()),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, Error> {
        let entry = self.backend.get(key.as_str()).await?;
        tracing::debug!(key = %key, hit = entry.is_some(), "storage get");
        Ok(entry)
    }

    /// Store an entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTtl` for a zero TTL, or whatever the backend reports.
    pub async fn set(&self, key: &CacheKey, entry: CacheEntry, ttl: Option<Duration>) -> Result<(), Error> {
        if ttl.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidTtl);
        }
        self.backend.set(key.as_str(), entry, ttl).await?;
        tracing::debug!(key = %key, ttl_ms = ttl.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)), "storage set");
        Ok(())
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        self.backend.delete(key.as_str()).await?;
        tracing::debug!(key = %key, "storage delete");
        Ok(())
    }
}
