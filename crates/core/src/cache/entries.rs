//! Cache entry CRUD operations for the SQLite store.
//!
//! Provides the storage backend contract on top of the `entries` table, plus the
//! maintenance operations (expiry and LRU purges).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::connection::SqliteStore;
use super::{CacheEntry, StorageBackend};
use crate::Error;

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Raw column values of one `entries` row.
type Row = (String, u16, String, String, Vec<u8>, String);

fn decode(row: Row) -> Result<CacheEntry, Error> {
    let (url, status, headers_json, policy_json, body, stored_at) = row;
    let stored_at = DateTime::parse_from_rfc3339(&stored_at)
        .map_err(|e| Error::InvalidEntry(format!("stored_at: {e}")))?
        .with_timezone(&Utc);

    Ok(CacheEntry {
        url,
        status,
        headers: serde_json::from_str(&headers_json)?,
        body,
        policy: serde_json::from_str(&policy_json)?,
        stored_at,
    })
}

impl SqliteStore {
    /// Insert or replace an entry.
    ///
    /// Uses UPSERT semantics: inserts if the key doesn't exist, replaces every
    /// column if it does.
    pub async fn upsert_entry(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<(), Error> {
        let key = key.to_string();
        let headers_json = serde_json::to_string(&entry.headers)?;
        let policy_json = serde_json::to_string(&entry.policy)?;
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl).map_err(|e| Error::InvalidEntry(e.to_string()))?;
                Some(timestamp(Utc::now() + ttl))
            }
            None => None,
        };
        let entry = entry.clone();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO entries (key, url, status, headers_json, policy_json, body, stored_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(key) DO UPDATE SET
                        url = excluded.url,
                        status = excluded.status,
                        headers_json = excluded.headers_json,
                        policy_json = excluded.policy_json,
                        body = excluded.body,
                        stored_at = excluded.stored_at,
                        expires_at = excluded.expires_at",
                    params![
                        &key,
                        &entry.url,
                        entry.status,
                        &headers_json,
                        &policy_json,
                        &entry.body,
                        timestamp(entry.stored_at),
                        &expires_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get a live entry by key.
    ///
    /// Returns None if the key doesn't exist or the entry has expired.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        let key = key.to_string();
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT url, status, headers_json, policy_json, body, stored_at
                     FROM entries
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )?;

                let result: rusqlite::Result<Row> = stmt.query_row(params![key, now], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                });

                match result {
                    Ok(row) => decode(row).map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete an entry. Returns whether a row was removed.
    pub async fn delete_entry(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Number of live entries.
    pub async fn len(&self) -> Result<u64, Error> {
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE expires_at IS NULL OR expires_at > ?1",
                    params![now],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired entries.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![now],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Purge oldest entries until count <= max_entries.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_lru(&self, max_entries: usize) -> Result<u64, Error> {
        let max = max_entries as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
                if count <= max {
                    return Ok(0);
                }

                let to_delete = count - max;
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE key IN (
                    SELECT key FROM entries ORDER BY stored_at ASC LIMIT ?1
                )",
                    params![to_delete],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        self.get_entry(key).await
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) -> Result<(), Error> {
        self.upsert_entry(key, &entry, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.delete_entry(key).await.map(|_| ())
    }
}
