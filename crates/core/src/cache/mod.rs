//! Cache keys, entries and storage.
//!
//! - Deterministic cache key derivation from request descriptors
//! - The storage backend contract and the `Storage` adapter
//! - An in-process map backend (the default)
//! - A SQLite backend with WAL mode, schema migrations and purge strategies

pub mod connection;
pub mod entries;
pub mod entry;
pub mod key;
pub mod memory;
pub mod migrations;
pub mod store;

pub use crate::Error;

pub use connection::SqliteStore;
pub use entry::CacheEntry;
pub use key::{CacheKey, KEY_PREFIX, cache_key, request_url};
pub use memory::MemoryStore;
pub use store::{Storage, StorageBackend};
