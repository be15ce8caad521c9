//! Cache policy oracle.
//!
//! The orchestrator never interprets `Cache-Control`, validators or ages itself. It
//! asks a [`PolicyOracle`] three questions and acts on the answers. The default
//! [`SemanticsOracle`] answers them with `http_cache_semantics::CachePolicy` and
//! persists the policy as its serde JSON form inside each [`CacheEntry`].

use std::time::{Duration, SystemTime};

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, IF_MODIFIED_SINCE, IF_NONE_MATCH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, request, response};
use http_cache_semantics::{AfterResponse, BeforeRequest, CachePolicy};
use stow_core::{CacheEntry, Error};

/// Whether a stored entry can be served as-is.
#[derive(Debug, Clone)]
pub enum Freshness {
    /// Serve without contacting the origin, using `headers`.
    Fresh { ttl: Duration, headers: HeaderMap },
    /// Revalidate with the origin, adding `conditional_headers` to the request.
    Stale { conditional_headers: HeaderMap },
}

/// Storability verdict for a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Storable { metadata: serde_json::Value, ttl: Duration },
    NotStorable,
}

/// Outcome of merging a revalidation response with a stored entry.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// The origin confirmed the stored entry and its headers did not change.
    Unchanged { decision: Decision },
    /// The origin confirmed the stored entry with an updated header set.
    Updated { headers: HeaderMap, decision: Decision },
    /// The origin sent a new representation that replaces the stored one.
    Replace { decision: Decision },
}

/// RFC 7234 caching semantics, treated as opaque by the orchestrator.
pub trait PolicyOracle: Send + Sync + 'static {
    /// Decide whether `stored` satisfies `request` without revalidation.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEntry` when the stored metadata cannot be decoded.
    fn evaluate_fresh(&self, request: &request::Parts, stored: &CacheEntry) -> Result<Freshness, Error>;

    /// Decide whether a response fetched from the origin may be stored.
    fn evaluate_new(&self, request: &request::Parts, status: StatusCode, headers: &HeaderMap) -> Decision;

    /// Merge a revalidation response with the stored entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEntry` when the stored metadata cannot be decoded.
    fn merge_revalidation(
        &self, request: &request::Parts, stored: &CacheEntry, status: StatusCode, headers: &HeaderMap,
    ) -> Result<Revalidation, Error>;
}

/// Oracle backed by `http-cache-semantics`, configured as a shared cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticsOracle;

impl SemanticsOracle {
    pub fn new() -> Self {
        Self
    }
}

fn decode(stored: &CacheEntry) -> Result<CachePolicy, Error> {
    serde_json::from_value(stored.policy.clone())
        .map_err(|e| Error::InvalidEntry(format!("unreadable policy metadata for {}: {e}", stored.url)))
}

fn decide(policy: &CachePolicy, now: SystemTime) -> Decision {
    if !policy.is_storable() {
        return Decision::NotStorable;
    }

    match serde_json::to_value(policy) {
        Ok(metadata) => Decision::Storable { metadata, ttl: policy.time_to_live(now) },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize cache policy");
            Decision::NotStorable
        }
    }
}

/// Stored headers updated with those of a 304. Representation framing headers are
/// never taken from the 304.
fn merge_headers(stored: &HeaderMap, update: &HeaderMap) -> HeaderMap {
    let mut merged = stored.clone();
    for name in update.keys() {
        if [CONTENT_LENGTH, CONTENT_ENCODING, CONTENT_RANGE, TRANSFER_ENCODING].contains(name) {
            continue;
        }
        merged.remove(name);
        for value in update.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

fn response_head(status: StatusCode, headers: &HeaderMap) -> response::Parts {
    let (mut parts, ()) = http::Response::new(()).into_parts();
    parts.status = status;
    parts.headers = headers.clone();
    parts
}

impl PolicyOracle for SemanticsOracle {
    fn evaluate_fresh(&self, request: &request::Parts, stored: &CacheEntry) -> Result<Freshness, Error> {
        let policy = decode(stored)?;
        let now = SystemTime::now();

        match policy.before_request(request, now) {
            BeforeRequest::Fresh(parts) => Ok(Freshness::Fresh { ttl: policy.time_to_live(now), headers: parts.headers }),
            BeforeRequest::Stale { request: revalidation, .. } => {
                let mut conditional_headers = HeaderMap::new();
                for name in [IF_NONE_MATCH, IF_MODIFIED_SINCE] {
                    for value in revalidation.headers.get_all(&name) {
                        conditional_headers.append(name.clone(), value.clone());
                    }
                }
                Ok(Freshness::Stale { conditional_headers })
            }
        }
    }

    fn evaluate_new(&self, request: &request::Parts, status: StatusCode, headers: &HeaderMap) -> Decision {
        let policy = CachePolicy::new(request, &response_head(status, headers));
        decide(&policy, SystemTime::now())
    }

    fn merge_revalidation(
        &self, request: &request::Parts, stored: &CacheEntry, status: StatusCode, headers: &HeaderMap,
    ) -> Result<Revalidation, Error> {
        let policy = decode(stored)?;
        let now = SystemTime::now();

        let stored_headers = stored.header_map()?;

        let (policy, merged) = match policy.after_response(request, &response_head(status, headers), now) {
            AfterResponse::NotModified(policy, parts) => (policy, parts.headers),
            AfterResponse::Modified(policy, _) if status != StatusCode::NOT_MODIFIED => {
                return Ok(Revalidation::Replace { decision: decide(&policy, now) });
            }
            // A 304 whose validators do not line up with the stored ones still
            // confirms the stored body.
            AfterResponse::Modified(..) => {
                let merged = merge_headers(&stored_headers, headers);
                (CachePolicy::new(request, &response_head(stored.status_code()?, &merged)), merged)
            }
        };

        let decision = decide(&policy, now);
        if merged == stored_headers {
            Ok(Revalidation::Unchanged { decision })
        } else {
            Ok(Revalidation::Updated { headers: merged, decision })
        }
    }
}
