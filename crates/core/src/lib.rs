//! Core types and shared functionality for stow.
//!
//! This crate provides:
//! - Request descriptors and cache key derivation
//! - The storage backend contract, the storage adapter and bundled backends
//! - Unified storage error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod request;

pub use cache::{CacheEntry, CacheKey, MemoryStore, SqliteStore, Storage, StorageBackend, cache_key};
pub use config::{CacheConfig, ConfigError};
pub use error::Error;
pub use request::{BodyStream, BoxError, CacheOverrides, RequestBody, RequestDescriptor};
