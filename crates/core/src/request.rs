//! Normalized view of an outgoing request.
//!
//! A [`RequestDescriptor`] carries everything the cache layer needs to derive a cache
//! key and everything a transport needs to issue the request, plus the per-request
//! cache overrides (`cache`, `strict_ttl`, `max_ttl`, `force_refresh`,
//! `automatic_failover`).

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use http::HeaderMap;

use crate::cache::Storage;

/// Boxed error type used for transport and body stream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A streamed request or response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Request body.
///
/// A finite payload participates in the cache key; a stream cannot be hashed
/// without consuming it, so requests carrying one always bypass the cache.
pub enum RequestBody {
    Bytes(Bytes),
    Stream(BodyStream),
}

impl RequestBody {
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Bytes(Bytes::from(text))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

/// Per-request cache options. `None` defers to the client-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct CacheOverrides {
    pub cache: Option<bool>,
    /// Backend used for this request instead of the client's own.
    pub storage: Option<Storage>,
    pub strict_ttl: Option<bool>,
    pub max_ttl: Option<Duration>,
    pub force_refresh: Option<bool>,
    pub automatic_failover: Option<bool>,
}

/// Normalized view of an outgoing request.
#[derive(Debug, Default)]
pub struct RequestDescriptor {
    /// HTTP method; `GET` when unset.
    pub method: Option<String>,
    /// Scheme with trailing colon; `http:` when unset.
    pub protocol: Option<String>,
    pub host: Option<String>,
    /// Takes precedence over `host`.
    pub hostname: Option<String>,
    pub port: Option<u16>,
    /// Path including the query string.
    pub path: Option<String>,
    /// Credentials as `user:pass`.
    pub auth: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    pub overrides: CacheOverrides,
}

impl RequestDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn stream_body(mut self, body: BodyStream) -> Self {
        self.body = Some(RequestBody::Stream(body));
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.overrides.cache = Some(enabled);
        self
    }

    pub fn storage(mut self, storage: Storage) -> Self {
        self.overrides.storage = Some(storage);
        self
    }

    pub fn strict_ttl(mut self, strict: bool) -> Self {
        self.overrides.strict_ttl = Some(strict);
        self
    }

    pub fn max_ttl(mut self, max_ttl: Duration) -> Self {
        self.overrides.max_ttl = Some(max_ttl);
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.overrides.force_refresh = Some(force);
        self
    }

    pub fn automatic_failover(mut self, failover: bool) -> Self {
        self.overrides.automatic_failover = Some(failover);
        self
    }

    /// Effective method.
    pub fn method_str(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    /// Effective protocol, always ending with `:`.
    pub fn protocol_str(&self) -> &str {
        self.protocol.as_deref().unwrap_or("http:")
    }

    /// Effective host: `hostname`, then `host`, then `localhost`.
    pub fn host_str(&self) -> &str {
        self.hostname
            .as_deref()
            .or(self.host.as_deref())
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
    }

    /// Port to print in a URL, omitted when it is the protocol default.
    pub fn explicit_port(&self) -> Option<u16> {
        let default = match self.protocol_str() {
            "https:" => 443,
            "http:" => 80,
            _ => return self.port,
        };
        self.port.filter(|p| *p != default)
    }

    /// Effective path for issuing the request.
    pub fn path_str(&self) -> &str {
        match self.path.as_deref() {
            Some(path) if !path.is_empty() => path,
            _ => "/",
        }
    }

    /// Whether the body can never be part of a cache key.
    pub fn has_stream_body(&self) -> bool {
        self.body.as_ref().is_some_and(RequestBody::is_stream)
    }
}

impl From<&url::Url> for RequestDescriptor {
    fn from(url: &url::Url) -> Self {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let auth = match (url.username(), url.password()) {
            ("", None) => None,
            (user, Some(pass)) => Some(format!("{user}:{pass}")),
            (user, None) => Some(user.to_string()),
        };

        Self {
            protocol: Some(format!("{}:", url.scheme())),
            hostname: url.host_str().map(str::to_string),
            port: url.port(),
            path: Some(path),
            auth,
            ..Default::default()
        }
    }
}

impl From<url::Url> for RequestDescriptor {
    fn from(url: url::Url) -> Self {
        Self::from(&url)
    }
}
