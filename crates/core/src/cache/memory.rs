//! In-process storage backend.
//!
//! The default backend when no other is configured. Entries live in a `HashMap`
//! behind a tokio `RwLock`, each with an optional expiry instant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheEntry, StorageBackend};
use crate::Error;

struct Slot {
    entry: CacheEntry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory cache backend.
///
/// Cloning yields another handle onto the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().filter(|slot| !slot.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, slot| !slot.is_expired());
        before - entries.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|slot| !slot.is_expired()).map(|slot| slot.entry.clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) -> Result<(), Error> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().await.insert(key.to_string(), Slot { entry, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
