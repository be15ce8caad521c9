//! Effective cache options for a request.

use std::time::Duration;

use stow_core::{CacheConfig, CacheOverrides};

use crate::policy::Decision;

/// Client-wide cache options. Per-request overrides are merged with [`CacheOptions::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Consult and update storage (default: true)
    pub cache: bool,

    /// Expire entries when the policy TTL runs out (default: false)
    pub strict_ttl: bool,

    /// Upper bound for entry lifetime (default: none)
    pub max_ttl: Option<Duration>,

    /// Never serve from storage, always refetch (default: false)
    pub force_refresh: bool,

    /// Treat storage lookup failures as misses (default: false)
    pub automatic_failover: bool,

    /// Largest body that will be buffered for storage (default: 5MB)
    pub max_body_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache: true,
            strict_ttl: false,
            max_ttl: None,
            force_refresh: false,
            automatic_failover: false,
            max_body_bytes: 5_242_880,
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            strict_ttl: config.strict_ttl,
            max_ttl: config.max_ttl(),
            automatic_failover: config.automatic_failover,
            max_body_bytes: config.max_body_bytes,
            ..Default::default()
        }
    }
}

impl CacheOptions {
    /// Options with per-request overrides applied on top.
    pub fn apply(&self, overrides: &CacheOverrides) -> Self {
        Self {
            cache: overrides.cache.unwrap_or(self.cache),
            strict_ttl: overrides.strict_ttl.unwrap_or(self.strict_ttl),
            max_ttl: overrides.max_ttl.or(self.max_ttl),
            force_refresh: overrides.force_refresh.unwrap_or(self.force_refresh),
            automatic_failover: overrides.automatic_failover.unwrap_or(self.automatic_failover),
            max_body_bytes: self.max_body_bytes,
        }
    }

    /// Storage TTL for a storable response.
    ///
    /// `None` means the response must not be stored. `Some(None)` stores without
    /// expiry. The policy TTL only counts under `strict_ttl`, where a zero TTL is never
    /// stored. `max_ttl` caps the TTL, or stands in for it when there is none.
    pub fn storage_ttl(&self, decision: &Decision) -> Option<Option<Duration>> {
        let Decision::Storable { ttl, .. } = decision else {
            return None;
        };

        let mut effective = None;
        if self.strict_ttl {
            if ttl.is_zero() {
                return None;
            }
            effective = Some(*ttl);
        }
        if let Some(max) = self.max_ttl {
            effective = Some(effective.map_or(max, |t| t.min(max)));
        }

        match effective {
            Some(t) if t.is_zero() => None,
            other => Some(other),
        }
    }
}
