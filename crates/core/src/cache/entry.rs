//! Persisted cache entries.

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A stored response.
///
/// Holds everything needed to rebuild the response and to recompute its freshness
/// later: status, headers, body and the policy metadata produced by the cache
/// policy oracle. The metadata is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub policy: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry from a completed exchange.
    ///
    /// Header values that are not valid UTF-8 are dropped.
    pub fn new(
        url: impl Into<String>, status: StatusCode, headers: &HeaderMap, body: Vec<u8>, policy: serde_json::Value,
    ) -> Self {
        Self {
            url: url.into(),
            status: status.as_u16(),
            headers: headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string())))
                .collect(),
            body,
            policy,
            stored_at: Utc::now(),
        }
    }

    /// Stored status code.
    pub fn status_code(&self) -> Result<StatusCode, Error> {
        StatusCode::from_u16(self.status).map_err(|e| Error::InvalidEntry(e.to_string()))
    }

    /// Stored headers as a header map.
    pub fn header_map(&self) -> Result<HeaderMap, Error> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::InvalidEntry(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| Error::InvalidEntry(e.to_string()))?;
            map.append(name, value);
        }
        Ok(map)
    }

    /// Copy of this entry with new headers and policy metadata, keeping the body.
    pub fn refreshed(&self, headers: &HeaderMap, policy: serde_json::Value) -> Self {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Self::new(self.url.clone(), status, headers, self.body.clone(), policy)
    }
}
