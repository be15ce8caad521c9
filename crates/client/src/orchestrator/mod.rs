//! Cache orchestration.
//!
//! Every request runs on its own task and walks the same path: build a key, look the
//! key up, then serve the stored entry, revalidate it or fetch from the origin. Fetched
//! bodies are forwarded to the caller while a copy is buffered for storage, and the
//! entry is only written once the body completed without error or abort.
//!
//! Storage failures after the response was delivered never fail the request; they
//! are reported as notices on the [`RequestHandle`].

mod handle;

pub use handle::{Dispatched, RequestHandle};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use http::{HeaderMap, StatusCode, request};
use tokio::sync::{mpsc, oneshot, watch};

use crate::Error;
use crate::options::CacheOptions;
use crate::policy::{Decision, Freshness, PolicyOracle, Revalidation, SemanticsOracle};
use crate::response::{Response, ResponseBody};
use crate::transport::{HttpTransport, OutgoingRequest, Transport, TransportConfig, TransportResponse, parse_descriptor};
use stow_core::{CacheConfig, CacheEntry, CacheKey, RequestDescriptor, Storage, cache_key};

/// Anything a request can be started from.
#[derive(Debug)]
pub enum RequestInput {
    Descriptor(RequestDescriptor),
    Url(url::Url),
    /// URL string, canonicalized before use.
    Text(String),
}

impl From<RequestDescriptor> for RequestInput {
    fn from(desc: RequestDescriptor) -> Self {
        RequestInput::Descriptor(desc)
    }
}

impl From<url::Url> for RequestInput {
    fn from(url: url::Url) -> Self {
        RequestInput::Url(url)
    }
}

impl From<&str> for RequestInput {
    fn from(text: &str) -> Self {
        RequestInput::Text(text.to_string())
    }
}

impl From<String> for RequestInput {
    fn from(text: String) -> Self {
        RequestInput::Text(text)
    }
}

impl RequestInput {
    fn into_descriptor(self) -> Result<RequestDescriptor, Error> {
        match self {
            RequestInput::Descriptor(desc) => Ok(desc),
            RequestInput::Url(url) => Ok(RequestDescriptor::from(url)),
            RequestInput::Text(text) => parse_descriptor(&text).map_err(Error::request),
        }
    }
}

/// HTTP client wrapper that answers requests from storage when caching rules allow.
#[derive(Clone)]
pub struct CacheableRequest {
    transport: Arc<dyn Transport>,
    storage: Storage,
    oracle: Arc<dyn PolicyOracle>,
    defaults: CacheOptions,
}

impl fmt::Debug for CacheableRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheableRequest")
            .field("storage", &self.storage)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl CacheableRequest {
    pub fn new(transport: impl Transport, storage: Storage) -> Self {
        Self {
            transport: Arc::new(transport),
            storage,
            oracle: Arc::new(SemanticsOracle),
            defaults: CacheOptions::default(),
        }
    }

    /// Client backed by a private in-process map.
    pub fn in_memory(transport: impl Transport) -> Self {
        Self::new(transport, Storage::in_memory())
    }

    /// Client with storage and default options taken from configuration.
    pub async fn from_config(config: &CacheConfig, transport: impl Transport) -> Result<Self, Error> {
        let storage = Storage::open(config).await?;
        Ok(Self::new(transport, storage).with_options(CacheOptions::from(config)))
    }

    /// Client using the bundled HTTP transport, everything taken from configuration.
    pub async fn http(config: &CacheConfig) -> Result<Self, Error> {
        let transport = HttpTransport::new(TransportConfig::from(config))?;
        Self::from_config(config, transport).await
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn with_oracle(mut self, oracle: impl PolicyOracle) -> Self {
        self.oracle = Arc::new(oracle);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn options(&self) -> &CacheOptions {
        &self.defaults
    }

    /// Start a request on a new task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, input: impl Into<RequestInput>) -> RequestHandle {
        let (dispatched_tx, dispatched_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let run = Run {
            client: self.clone(),
            dispatched: Some(dispatched_tx),
            outcome: Some(outcome_tx),
            notices: notice_tx,
            abort: abort_rx,
        };
        let task = tokio::spawn(run.execute(input.into()));

        RequestHandle {
            dispatched: Some(dispatched_rx),
            outcome: Some(outcome_rx),
            notices: notice_rx,
            abort: abort_tx,
            task: Some(task),
        }
    }

    /// Run a request and wait for its response. Background storage work continues
    /// after this returns.
    pub async fn send(&self, input: impl Into<RequestInput>) -> Result<Response, Error> {
        self.request(input).response().await
    }
}

/// Where and how a keyed request is persisted.
struct Target {
    storage: Storage,
    key: CacheKey,
    options: CacheOptions,
    had_prior: bool,
}

enum Revalidated {
    /// The stored entry was served.
    Served,
    /// The origin answered with a new representation.
    Changed(TransportResponse, Decision),
    /// The stored entry could not be merged; fetch without validators.
    Failed,
}

/// State of one request task.
struct Run {
    client: CacheableRequest,
    dispatched: Option<oneshot::Sender<Dispatched>>,
    outcome: Option<oneshot::Sender<Result<Response, Error>>>,
    notices: mpsc::UnboundedSender<Error>,
    abort: watch::Receiver<bool>,
}

/// Resolves once `abort` flips to true. Never resolves if the handle is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Run {
    async fn execute(mut self, input: RequestInput) {
        if let Err(e) = self.run(input).await {
            self.fail(e);
        }
    }

    async fn run(&mut self, input: RequestInput) -> Result<(), Error> {
        let mut desc = input.into_descriptor()?;
        let options = self.client.defaults.apply(&desc.overrides);
        let storage = desc.overrides.storage.clone().unwrap_or_else(|| self.client.storage.clone());

        let key = if options.cache { cache_key(&desc) } else { None };
        let mut request = OutgoingRequest::from_descriptor(&mut desc)?;

        let Some(key) = key else {
            tracing::debug!("cache bypass for {}", request.url);
            let TransportResponse { status, headers, url, body } = self.dispatch(request).await?;
            self.deliver(Response { status, headers, url, from_cache: false, body: ResponseBody::Stream(body) });
            return Ok(());
        };

        let head = request.head()?;
        let mut target = Target { storage, key, options, had_prior: false };
        let prior = self.lookup(&target).await?;
        target.had_prior = prior.is_some();

        let mut fetched = None;
        match prior {
            Some(_) if target.options.force_refresh => {
                tracing::debug!("forced refresh for {}", target.key);
            }
            Some(entry) => match self.client.oracle.evaluate_fresh(&head, &entry) {
                Ok(Freshness::Fresh { headers, .. }) => match Response::cached(&entry, headers) {
                    Ok(response) => {
                        tracing::debug!("cache hit for {}", target.key);
                        self.deliver(response);
                        return Ok(());
                    }
                    Err(e) => self.invalid_entry(&target, e)?,
                },
                Ok(Freshness::Stale { conditional_headers }) => {
                    tracing::debug!("revalidating {}", target.key);
                    match self.revalidate(&mut request, &head, &entry, &conditional_headers, &target).await? {
                        Revalidated::Served => return Ok(()),
                        Revalidated::Changed(response, decision) => fetched = Some((response, decision)),
                        Revalidated::Failed => {}
                    }
                }
                Err(e) => self.invalid_entry(&target, e)?,
            },
            None => tracing::debug!("cache miss for {}", target.key),
        }

        let (response, decision) = match fetched {
            Some(fetched) => fetched,
            None => {
                let response = self.dispatch(request).await?;
                let decision = self.client.oracle.evaluate_new(&head, response.status, &response.headers);
                (response, decision)
            }
        };

        self.fetch(response, decision, &target).await
    }

    /// Storage lookup. With failover a failing backend counts as a miss.
    async fn lookup(&self, target: &Target) -> Result<Option<CacheEntry>, Error> {
        match self.guarded(target.storage.get(&target.key)).await? {
            Ok(entry) => Ok(entry),
            Err(e) if target.options.automatic_failover => {
                tracing::warn!(key = %target.key, "cache lookup failed, falling back to network: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A stored entry that cannot be used. Fatal unless failover is on.
    fn invalid_entry(&self, target: &Target, e: stow_core::Error) -> Result<(), Error> {
        if !target.options.automatic_failover {
            return Err(e.into());
        }
        tracing::warn!(key = %target.key, "ignoring unusable cache entry: {e}");
        Ok(())
    }

    async fn revalidate(
        &mut self, request: &mut OutgoingRequest, head: &request::Parts, entry: &CacheEntry, conditional: &HeaderMap,
        target: &Target,
    ) -> Result<Revalidated, Error> {
        let Some(mut conditional_request) = request.replay() else {
            return Err(Error::request("streamed request bodies cannot be revalidated"));
        };
        for (name, value) in conditional {
            if !request.headers.contains_key(name) {
                conditional_request.headers.append(name.clone(), value.clone());
            }
        }

        let response = self.dispatch(conditional_request).await?;

        let merged = match self.client.oracle.merge_revalidation(head, entry, response.status, &response.headers) {
            Ok(Revalidation::Unchanged { decision }) => entry.header_map().map(|headers| (headers, decision)),
            Ok(Revalidation::Updated { headers, decision }) => Ok((headers, decision)),
            Ok(Revalidation::Replace { decision }) => {
                tracing::debug!("{} changed on the origin", target.key);
                return Ok(Revalidated::Changed(response, decision));
            }
            Err(e) => Err(e),
        };
        let served = merged
            .and_then(|(headers, decision)| Ok((Response::cached(entry, headers.clone())?, headers, decision)));

        let (served, headers, decision) = match served {
            Ok(served) => served,
            Err(e) => {
                self.notify(e.into());
                if response.status == StatusCode::NOT_MODIFIED {
                    return Ok(Revalidated::Failed);
                }
                let decision = self.client.oracle.evaluate_new(head, response.status, &response.headers);
                return Ok(Revalidated::Changed(response, decision));
            }
        };

        tracing::debug!("{} not modified, serving stored body", target.key);
        self.deliver(served);

        let ttl = target.options.storage_ttl(&decision);
        match (decision, ttl) {
            (Decision::Storable { metadata, .. }, Some(ttl)) => {
                self.store(target, entry.refreshed(&headers, metadata), ttl).await;
            }
            _ => self.forget(target).await,
        }

        Ok(Revalidated::Served)
    }

    /// Deliver a network response, buffering it for storage when it may be kept.
    async fn fetch(&mut self, response: TransportResponse, decision: Decision, target: &Target) -> Result<(), Error> {
        let TransportResponse { status, headers, url, mut body } = response;

        let ttl = target.options.storage_ttl(&decision);
        let (metadata, ttl) = match (decision, ttl) {
            (Decision::Storable { metadata, .. }, Some(ttl)) => (metadata, ttl),
            _ => {
                tracing::debug!("not storing {} ({})", target.key, status);
                self.deliver(Response { status, headers, url, from_cache: false, body: ResponseBody::Stream(body) });
                self.forget(target).await;
                return Ok(());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.deliver(Response {
            status,
            headers: headers.clone(),
            url: url.clone(),
            from_cache: false,
            body: ResponseBody::Channel(rx),
        });

        let max_bytes = target.options.max_body_bytes;
        let mut caller = Some(tx);
        let mut buffer = Some(BytesMut::new());
        let mut abort = self.abort.clone();

        loop {
            let next = tokio::select! {
                biased;
                () = aborted(&mut abort) => {
                    tracing::debug!("aborted while reading {}", url);
                    if let Some(tx) = caller.take() {
                        let _ = tx.send(Err(Box::new(Error::Aborted)));
                    }
                    return Ok(());
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let Some(buf) = buffer.as_mut() {
                        if buf.len() + chunk.len() > max_bytes {
                            tracing::debug!("body of {} exceeds {} bytes, not storing", url, max_bytes);
                            buffer = None;
                        } else {
                            buf.extend_from_slice(&chunk);
                        }
                    }
                    let gone = caller.as_ref().is_some_and(|tx| tx.send(Ok(chunk)).is_err());
                    if gone {
                        caller = None;
                    }
                    if buffer.is_none() && caller.is_none() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("body of {} failed: {e}", url);
                    if let Some(tx) = caller.take() {
                        let _ = tx.send(Err(e));
                    }
                    return Ok(());
                }
                None => break,
            }
        }
        drop(caller);

        if let Some(buf) = buffer {
            let entry = CacheEntry::new(url, status, &headers, buf.to_vec(), metadata);
            self.store(target, entry, ttl).await;
        }
        Ok(())
    }

    async fn store(&self, target: &Target, entry: CacheEntry, ttl: Option<Duration>) {
        if *self.abort.borrow() {
            return;
        }
        match target.storage.set(&target.key, entry, ttl).await {
            Ok(()) => tracing::debug!("stored {}", target.key),
            Err(e) => self.notify(e.into()),
        }
    }

    /// Drop a prior entry that a newer response made obsolete.
    async fn forget(&self, target: &Target) {
        if !target.had_prior || *self.abort.borrow() {
            return;
        }
        match target.storage.delete(&target.key).await {
            Ok(()) => tracing::debug!("deleted {}", target.key),
            Err(e) => self.notify(e.into()),
        }
    }

    async fn dispatch(&mut self, request: OutgoingRequest) -> Result<TransportResponse, Error> {
        if *self.abort.borrow() {
            return Err(Error::Aborted);
        }
        if let Some(tx) = self.dispatched.take() {
            let _ = tx.send(Dispatched {
                method: request.method.clone(),
                url: request.url.to_string(),
                headers: request.headers.clone(),
            });
        }

        tracing::debug!("{} {}", request.method, request.url);
        self.guarded(self.client.transport.send(request)).await?.map_err(Error::Request)
    }

    /// Run `fut` unless the request is aborted first.
    async fn guarded<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        let mut abort = self.abort.clone();
        tokio::select! {
            biased;
            () = aborted(&mut abort) => Err(Error::Aborted),
            output = fut => Ok(output),
        }
    }

    fn deliver(&mut self, response: Response) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(Ok(response));
        }
    }

    fn fail(&mut self, e: Error) {
        match self.outcome.take() {
            Some(tx) => {
                tracing::debug!("request failed: {e}");
                let _ = tx.send(Err(e));
            }
            None => self.notify(e),
        }
    }

    fn notify(&self, e: Error) {
        tracing::warn!("{e}");
        let _ = self.notices.send(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
    use http::{HeaderName, HeaderValue};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stow_core::{BodyStream, BoxError, MemoryStore, StorageBackend};

    type Handler = dyn Fn(&OutgoingRequest, usize) -> TransportResponse + Send + Sync;

    /// Test origin that counts calls and records the headers it saw.
    #[derive(Clone)]
    struct Origin {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<HeaderMap>>>,
        handler: Arc<Handler>,
    }

    impl Origin {
        fn new(handler: impl Fn(&OutgoingRequest, usize) -> TransportResponse + Send + Sync + 'static) -> Self {
            Self { calls: Arc::default(), seen: Arc::default(), handler: Arc::new(handler) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn seen(&self, call: usize) -> HeaderMap {
            self.seen.lock().unwrap()[call].clone()
        }
    }

    #[async_trait]
    impl Transport for Origin {
        async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BoxError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push(request.headers.clone());
            Ok((self.handler)(&request, n))
        }
    }

    fn reply(status: u16, pairs: &[(HeaderName, &str)], body: impl Into<Bytes>) -> TransportResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        TransportResponse::full(StatusCode::from_u16(status).unwrap(), headers, "http://example.com/", body)
    }

    /// Backend double that records TTLs and can be told to fail.
    #[derive(Clone, Default)]
    struct Flaky {
        inner: MemoryStore,
        fail_get: bool,
        fail_set: bool,
        fail_delete: bool,
        gets: Arc<AtomicUsize>,
        ttls: Arc<Mutex<Vec<Option<Duration>>>>,
    }

    #[async_trait]
    impl StorageBackend for Flaky {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, stow_core::Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail_get {
                return Err(stow_core::Error::backend("Fail"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) -> Result<(), stow_core::Error> {
            self.ttls.lock().unwrap().push(ttl);
            if self.fail_set {
                return Err(stow_core::Error::backend("Fail"));
            }
            self.inner.set(key, entry, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), stow_core::Error> {
            if self.fail_delete {
                return Err(stow_core::Error::backend("Fail"));
            }
            self.inner.delete(key).await
        }
    }

    struct Outcome {
        from_cache: bool,
        status: StatusCode,
        body: String,
        notices: Vec<Error>,
    }

    async fn run(client: &CacheableRequest, input: impl Into<RequestInput>) -> Outcome {
        let mut handle = client.request(input);
        let response = handle.response().await.unwrap();
        let (from_cache, status) = (response.from_cache, response.status);
        let body = response.text().await.unwrap();
        let notices = handle.settled().await;
        Outcome { from_cache, status, body, notices }
    }

    fn at(path: &str) -> RequestDescriptor {
        RequestDescriptor::new().hostname("example.com").path(path)
    }

    fn counting(cache_control: &'static str) -> Origin {
        Origin::new(move |_, n| reply(200, &[(CACHE_CONTROL, cache_control)], n.to_string()))
    }

    fn etag_origin() -> Origin {
        Origin::new(|request, _| {
            if request.headers.get(IF_NONE_MATCH).is_some_and(|v| v == "\"33a64df5\"") {
                reply(304, &[(ETAG, "\"33a64df5\"")], "")
            } else {
                reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"33a64df5\"")], "etag")
            }
        })
    }

    #[tokio::test]
    async fn test_no_store_is_never_cached() {
        let store = MemoryStore::new();
        let origin = counting("no-store");
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        let first = run(&client, at("/no-store")).await;
        let second = run(&client, at("/no-store")).await;

        assert_eq!(first.body, "1");
        assert_eq!(second.body, "2");
        assert!(!second.from_cache);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_max_age_is_served_from_cache() {
        let store = MemoryStore::new();
        let origin = counting("max-age=60");
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        let first = run(&client, at("/cache")).await;
        assert!(!first.from_cache);
        assert_eq!(store.len().await, 1);

        let mut handle = client.request(at("/cache"));
        let response = handle.response().await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(CACHE_CONTROL).unwrap(), "max-age=60");
        assert_eq!(response.text().await.unwrap(), "1");
        assert!(handle.dispatched().await.is_none());

        assert_eq!(origin.calls(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_url_string_input_is_cached() {
        let origin = counting("max-age=60");
        let client = CacheableRequest::in_memory(origin.clone());

        run(&client, "http://example.com/cache").await;
        let second = run(&client, "http://example.com/cache#frag").await;

        assert!(second.from_cache);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_revalidates_with_etag() {
        let store = MemoryStore::new();
        let origin = etag_origin();
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        let first = run(&client, at("/etag")).await;
        assert!(!first.from_cache);

        let mut handle = client.request(at("/etag"));
        let dispatched = handle.dispatched().await.unwrap();
        assert_eq!(dispatched.headers.get(IF_NONE_MATCH).unwrap(), "\"33a64df5\"");

        let response = handle.response().await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "etag");
        assert!(handle.settled().await.is_empty());

        assert_eq!(origin.calls(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_revalidates_with_last_modified() {
        let origin = Origin::new(|request, _| {
            if request.headers.contains_key(IF_MODIFIED_SINCE) {
                reply(304, &[], "")
            } else {
                reply(
                    200,
                    &[(CACHE_CONTROL, "max-age=0"), (LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT")],
                    "last-modified",
                )
            }
        });
        let client = CacheableRequest::in_memory(origin.clone());

        run(&client, at("/last-modified")).await;
        let second = run(&client, at("/last-modified")).await;

        assert!(second.from_cache);
        assert_eq!(second.body, "last-modified");
        assert_eq!(origin.seen(1).get(IF_MODIFIED_SINCE).unwrap(), "Wed, 21 Oct 2015 07:28:00 GMT");
    }

    #[tokio::test]
    async fn test_bare_not_modified_serves_stored_etag_body() {
        let store = MemoryStore::new();
        let origin = Origin::new(|request, _| {
            if request.headers.contains_key(IF_NONE_MATCH) {
                reply(304, &[], "")
            } else {
                reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"33a64df5\"")], "etag")
            }
        });
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        run(&client, at("/etag")).await;
        let second = run(&client, at("/etag")).await;

        assert!(second.from_cache);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, "etag");
        assert!(second.notices.is_empty());
        assert_eq!(origin.calls(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_caller_validator_wins() {
        let origin = etag_origin();
        let client = CacheableRequest::in_memory(origin.clone());

        run(&client, at("/etag")).await;
        let second = run(
            &client,
            at("/etag").header(IF_NONE_MATCH, HeaderValue::from_static("\"mine\"")),
        )
        .await;

        assert_eq!(origin.seen(1).get_all(IF_NONE_MATCH).iter().count(), 1);
        assert_eq!(origin.seen(1).get(IF_NONE_MATCH).unwrap(), "\"mine\"");
        assert!(!second.from_cache);
    }

    #[tokio::test]
    async fn test_modified_response_replaces_entry() {
        let store = MemoryStore::new();
        let origin = Origin::new(|_, n| {
            let etag = format!("\"v{n}\"");
            reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, etag.as_str())], format!("body {n}"))
        });
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        run(&client, at("/revalidate-modified")).await;
        let second = run(&client, at("/revalidate-modified")).await;

        assert!(!second.from_cache);
        assert_eq!(second.body, "body 2");
        assert_eq!(origin.calls(), 2);
        assert!(origin.seen(1).contains_key(IF_NONE_MATCH));

        let third = run(&client, at("/revalidate-modified")).await;
        assert_eq!(third.body, "body 3");
        assert_eq!(origin.seen(2).get(IF_NONE_MATCH).unwrap(), "\"v2\"");
    }

    #[tokio::test]
    async fn test_no_store_on_revalidation_deletes_entry() {
        let store = MemoryStore::new();
        let origin = Origin::new(|_, n| {
            if n == 1 {
                reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"33a64df5\"")], "cached")
            } else {
                reply(304, &[(CACHE_CONTROL, "no-store"), (ETAG, "\"33a64df5\"")], "")
            }
        });
        let client = CacheableRequest::new(origin, Storage::new(store.clone()));

        run(&client, at("/cache-then-no-store-on-revalidate")).await;
        assert_eq!(store.len().await, 1);

        let second = run(&client, at("/cache-then-no-store-on-revalidate")).await;
        assert!(second.from_cache);
        assert_eq!(second.body, "cached");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_uncacheable_replacement_deletes_entry() {
        let store = MemoryStore::new();
        let origin = Origin::new(|_, n| {
            if n == 1 {
                reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"33a64df5\"")], "cached")
            } else {
                reply(200, &[(CACHE_CONTROL, "no-store")], "fresh")
            }
        });
        let client = CacheableRequest::new(origin.clone(), Storage::new(store.clone()));

        run(&client, at("/cache-then-no-store")).await;
        assert_eq!(store.len().await, 1);

        let second = run(&client, at("/cache-then-no-store")).await;
        assert!(!second.from_cache);
        assert_eq!(second.body, "fresh");
        assert!(origin.seen(1).contains_key(IF_NONE_MATCH));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_fresh_hit_writes_nothing() {
        let backend = Flaky::default();
        let origin = counting("max-age=60");
        let client = CacheableRequest::new(origin.clone(), Storage::new(backend.clone()));

        run(&client, at("/cache")).await;
        let second = run(&client, at("/cache")).await;

        assert!(second.from_cache);
        assert_eq!(origin.calls(), 1);
        assert_eq!(backend.gets.load(Ordering::SeqCst), 2);
        assert_eq!(backend.ttls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh() {
        let origin = counting("max-age=60");
        let client = CacheableRequest::in_memory(origin.clone());

        assert_eq!(run(&client, at("/cache")).await.body, "1");

        let forced = run(&client, at("/cache").force_refresh(true)).await;
        assert!(!forced.from_cache);
        assert_eq!(forced.body, "2");

        let cached = run(&client, at("/cache")).await;
        assert!(cached.from_cache);
        assert_eq!(cached.body, "2");
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_error_status_is_not_cached() {
        let origin = Origin::new(|_, n| {
            if n == 1 { reply(502, &[], "Bad Gateway") } else { reply(200, &[(CACHE_CONTROL, "max-age=60")], "ok") }
        });
        let client = CacheableRequest::in_memory(origin.clone());

        let first = run(&client, at("/first-error")).await;
        assert_eq!(first.status, StatusCode::BAD_GATEWAY);

        let second = run(&client, at("/first-error")).await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, "ok");
        assert!(!second.from_cache);
    }

    #[tokio::test]
    async fn test_strict_ttl_is_passed_to_storage() {
        let backend = Flaky::default();
        let client = CacheableRequest::new(counting("max-age=100"), Storage::new(backend.clone()));

        run(&client, at("/ttl").strict_ttl(true)).await;

        let ttls = backend.ttls.lock().unwrap().clone();
        assert_eq!(ttls.len(), 1);
        let ttl = ttls[0].unwrap();
        assert!(ttl <= Duration::from_secs(100));
        assert!(ttl > Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_ttl_not_passed_without_strict_ttl() {
        let backend = Flaky::default();
        let client = CacheableRequest::new(counting("max-age=100"), Storage::new(backend.clone()));

        run(&client, at("/ttl")).await;

        assert_eq!(backend.ttls.lock().unwrap().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_max_ttl_caps_ttl() {
        let backend = Flaky::default();
        let client = CacheableRequest::new(counting("max-age=100"), Storage::new(backend.clone()))
            .with_options(CacheOptions { strict_ttl: true, max_ttl: Some(Duration::from_millis(1000)), ..Default::default() });

        run(&client, at("/ttl")).await;

        assert_eq!(backend.ttls.lock().unwrap().as_slice(), &[Some(Duration::from_millis(1000))]);
    }

    #[tokio::test]
    async fn test_strict_zero_ttl_is_not_stored() {
        let store = MemoryStore::new();
        let client = CacheableRequest::new(counting("max-age=0"), Storage::new(store.clone()));

        run(&client, at("/stale").strict_ttl(true)).await;

        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_strict_zero_ttl_ignores_max_ttl() {
        let backend = Flaky::default();
        let client = CacheableRequest::new(counting("max-age=0"), Storage::new(backend.clone()))
            .with_options(CacheOptions { strict_ttl: true, max_ttl: Some(Duration::from_secs(60)), ..Default::default() });

        run(&client, at("/stale")).await;

        assert!(backend.ttls.lock().unwrap().is_empty());
        assert_eq!(backend.inner.len().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_error_fails_without_network() {
        let origin = counting("max-age=60");
        let backend = Flaky { fail_get: true, ..Default::default() };
        let client = CacheableRequest::new(origin.clone(), Storage::new(backend));

        let mut handle = client.request(at("/cache"));
        let err = handle.response().await.unwrap_err();
        assert!(err.is_cache());
        assert_eq!(err.to_string(), "CACHE_ERROR: Fail");
        assert!(handle.dispatched().await.is_none());
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_lookup_error_with_failover() {
        let origin = counting("max-age=60");
        let backend = Flaky { fail_get: true, ..Default::default() };
        let client = CacheableRequest::new(origin.clone(), Storage::new(backend));

        let outcome = run(&client, at("/cache").automatic_failover(true)).await;

        assert_eq!(outcome.body, "1");
        assert_eq!(origin.calls(), 1);
        assert!(outcome.notices.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_is_a_notice() {
        let backend = Flaky { fail_set: true, ..Default::default() };
        let client = CacheableRequest::new(counting("max-age=60"), Storage::new(backend));

        let outcome = run(&client, at("/cache")).await;

        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.body, "1");
        assert_eq!(outcome.notices.len(), 1);
        assert!(outcome.notices[0].is_cache());
    }

    #[tokio::test]
    async fn test_delete_error_is_a_notice() {
        let backend = Flaky { fail_delete: true, ..Default::default() };
        let origin = Origin::new(|_, n| {
            if n == 1 {
                reply(200, &[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"33a64df5\"")], "cached")
            } else {
                reply(304, &[(CACHE_CONTROL, "no-store"), (ETAG, "\"33a64df5\"")], "")
            }
        });
        let client = CacheableRequest::new(origin, Storage::new(backend));

        run(&client, at("/cache-then-no-store-on-revalidate")).await;
        let mut handle = client.request(at("/cache-then-no-store-on-revalidate"));
        assert!(handle.response().await.unwrap().from_cache);

        let notice = handle.next_notice().await.unwrap();
        assert!(notice.is_cache());
        assert!(handle.next_notice().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_is_request_error() {
        let transport = |_: OutgoingRequest| async { Err::<TransportResponse, BoxError>("connection refused".into()) };
        let client = CacheableRequest::in_memory(transport);

        let err = client.send(at("/")).await.unwrap_err();
        assert!(err.is_request());
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_request_error() {
        let origin = counting("max-age=60");
        let client = CacheableRequest::in_memory(origin.clone());

        let err = client.send("ftp://example.com/file").await.unwrap_err();
        assert!(err.is_request());
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_streamed_body_bypasses_storage() {
        let backend = Flaky::default();
        let origin = counting("max-age=60");
        let client = CacheableRequest::new(origin.clone(), Storage::new(backend.clone()));

        let body: BodyStream = futures::stream::once(async { Ok::<_, BoxError>(Bytes::from_static(b"upload")) }).boxed();
        let outcome = run(&client, at("/upload").method("POST").stream_body(body)).await;

        assert_eq!(outcome.body, "1");
        assert_eq!(backend.gets.load(Ordering::SeqCst), 0);
        assert!(backend.ttls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_disabled_bypasses_storage() {
        let backend = Flaky::default();
        let origin = counting("max-age=60");
        let client = CacheableRequest::new(origin.clone(), Storage::new(backend.clone()));

        run(&client, at("/cache").cache(false)).await;
        run(&client, at("/cache").cache(false)).await;

        assert_eq!(origin.calls(), 2);
        assert_eq!(backend.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_body_hash_separates_entries() {
        let origin = counting("max-age=60");
        let client = CacheableRequest::in_memory(origin.clone());

        let a = run(&client, at("/echo").method("POST").body("a")).await;
        let b = run(&client, at("/echo").method("POST").body("b")).await;

        assert_eq!((a.body.as_str(), b.body.as_str()), ("1", "2"));
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_per_request_storage() {
        let shared = MemoryStore::new();
        let private = MemoryStore::new();
        let client = CacheableRequest::new(counting("max-age=60"), Storage::new(shared.clone()));

        run(&client, at("/cache").storage(Storage::new(private.clone()))).await;

        assert_eq!(private.len().await, 1);
        assert_eq!(shared.len().await, 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_delivered_not_stored() {
        let store = MemoryStore::new();
        let origin = Origin::new(|_, _| reply(200, &[(CACHE_CONTROL, "max-age=60")], "hello world"));
        let client = CacheableRequest::new(origin, Storage::new(store.clone()))
            .with_options(CacheOptions { max_body_bytes: 4, ..Default::default() });

        let outcome = run(&client, at("/big")).await;

        assert_eq!(outcome.body, "hello world");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_abort_before_response() {
        let store = MemoryStore::new();
        let transport = |_: OutgoingRequest| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(reply(200, &[(CACHE_CONTROL, "max-age=60")], "late"))
        };
        let client = CacheableRequest::new(transport, Storage::new(store.clone()));

        let mut handle = client.request(at("/delay"));
        assert!(handle.dispatched().await.is_some());
        handle.abort();

        assert!(matches!(handle.response().await, Err(Error::Aborted)));
        handle.settled().await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_abort_mid_body_is_not_stored() {
        let store = MemoryStore::new();
        let (chunks, rx) = mpsc::unbounded_channel::<Result<Bytes, BoxError>>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let transport = move |_: OutgoingRequest| {
            let rx = rx.lock().unwrap().take();
            async move {
                let Some(rx) = rx else {
                    return Err::<TransportResponse, BoxError>("already called".into());
                };
                let body = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|c| (c, rx)) });
                let mut headers = HeaderMap::new();
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
                Ok::<_, BoxError>(TransportResponse::streaming(StatusCode::OK, headers, "http://example.com/", body.boxed()))
            }
        };
        let client = CacheableRequest::new(transport, Storage::new(store.clone()));

        chunks.send(Ok(Bytes::from_static(b"first"))).unwrap();
        let mut handle = client.request(at("/stream"));
        let mut response = handle.response().await.unwrap();
        assert_eq!(response.body.next().await.unwrap().unwrap(), "first");

        handle.abort();
        assert!(matches!(response.bytes().await, Err(Error::Aborted)));

        handle.settled().await;
        assert_eq!(store.len().await, 0);
        drop(chunks);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = CacheConfig { strict_ttl: true, max_ttl_ms: Some(500), ..Default::default() };
        let client = CacheableRequest::from_config(&config, counting("max-age=60")).await.unwrap();

        assert!(client.options().strict_ttl);
        assert_eq!(client.options().max_ttl, Some(Duration::from_millis(500)));
        assert!(!run(&client, at("/cache")).await.from_cache);
    }
}
