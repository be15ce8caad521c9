//! Request-issuing transports.
//!
//! The orchestrator never performs network I/O itself: it hands an
//! [`OutgoingRequest`] to a [`Transport`] and receives a [`TransportResponse`] whose
//! body is a byte stream. Any async closure with the right signature is a
//! transport; [`HttpTransport`] is the bundled `reqwest` implementation.

pub mod url;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::{HeaderMap, Method, StatusCode, request};

pub use self::url::{UrlError, canonicalize, parse_descriptor};

use crate::Error;
use stow_core::{BodyStream, BoxError, CacheConfig, RequestBody, RequestDescriptor};

/// A request ready to be put on the wire.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: ::url::Url,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl OutgoingRequest {
    /// Build the wire request for a descriptor, consuming its headers and body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Request` when the method or the target URL is malformed.
    pub fn from_descriptor(desc: &mut RequestDescriptor) -> Result<Self, Error> {
        let method = Method::from_bytes(desc.method_str().as_bytes()).map_err(Error::request)?;

        let mut target = format!("{}//", desc.protocol_str());
        if let Some(auth) = desc.auth.as_deref().filter(|a| !a.is_empty()) {
            target.push_str(auth);
            target.push('@');
        }
        target.push_str(desc.host_str());
        if let Some(port) = desc.explicit_port() {
            target.push_str(&format!(":{port}"));
        }
        let path = desc.path_str();
        if !path.starts_with('/') {
            target.push('/');
        }
        target.push_str(path);

        let url = ::url::Url::parse(&target).map_err(Error::request)?;

        Ok(Self { method, url, headers: std::mem::take(&mut desc.headers), body: desc.body.take() })
    }

    /// Request head in the shape the policy oracle consumes.
    pub fn head(&self) -> Result<request::Parts, Error> {
        let (mut parts, ()) = http::Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .body(())
            .map_err(Error::request)?
            .into_parts();
        parts.headers = self.headers.clone();
        Ok(parts)
    }

    /// Copy of this request for a second transport call. `None` for streamed bodies,
    /// which can only be sent once.
    pub fn replay(&self) -> Option<Self> {
        let body = match &self.body {
            Some(RequestBody::Stream(_)) => return None,
            Some(RequestBody::Bytes(bytes)) => Some(RequestBody::Bytes(bytes.clone())),
            None => None,
        };
        Some(Self { method: self.method.clone(), url: self.url.clone(), headers: self.headers.clone(), body })
    }
}

/// Response produced by a transport.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL of the exchange.
    pub url: String,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Response with a body that is already in memory.
    pub fn full(status: StatusCode, headers: HeaderMap, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let stream = if body.is_empty() {
            futures::stream::empty().boxed()
        } else {
            futures::stream::once(async move { Ok(body) }).boxed()
        };
        Self { status, headers, url: url.into(), body: stream }
    }

    /// Response whose body arrives as a stream.
    pub fn streaming(status: StatusCode, headers: HeaderMap, url: impl Into<String>, body: BodyStream) -> Self {
        Self { status, headers, url: url.into(), body }
    }
}

/// Something that can issue HTTP requests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue the request and return as soon as the response head is available.
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BoxError>;
}

#[async_trait]
impl<F, Fut> Transport for F
where
    F: Fn(OutgoingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransportResponse, BoxError>> + Send + 'static,
{
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BoxError> {
        (self)(request).await
    }
}

/// Configuration for the bundled HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// User agent string (default: "stow/0.1")
    pub user_agent: String,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { user_agent: "stow/0.1".to_string(), timeout: Duration::from_millis(20000), max_redirects: 5 }
    }
}

impl From<&CacheConfig> for TransportConfig {
    fn from(config: &CacheConfig) -> Self {
        Self { user_agent: config.user_agent.clone(), timeout: config.timeout(), max_redirects: config.max_redirects }
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Create a new transport with the given configuration.
    pub fn new(config: TransportConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(Error::request)?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BoxError> {
        let OutgoingRequest { method, mut url, headers, body } = request;

        let credentials = if url.username().is_empty() {
            None
        } else {
            let creds = (url.username().to_string(), url.password().map(str::to_string));
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some(creds)
        };

        let mut builder = self.http.request(method, url.as_str()).headers(headers);
        if let Some((user, pass)) = credentials {
            builder = builder.basic_auth(user, pass);
        }
        builder = match body {
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes),
            Some(RequestBody::Stream(stream)) => builder.body(reqwest::Body::wrap_stream(stream)),
            None => builder,
        };

        let response = builder.send().await?;

        tracing::debug!("{} -> {}", url, response.status());

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().to_string();
        let body = response.bytes_stream().map_err(|e| Box::new(e) as BoxError).boxed();

        Ok(TransportResponse::streaming(status, headers, final_url, body))
    }
}
