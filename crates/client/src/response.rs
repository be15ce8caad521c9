//! Responses handed to callers, whether served from storage or from the network.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;

use crate::Error;
use stow_core::{BodyStream, BoxError, CacheEntry};

/// Body of a [`Response`], readable as a stream of chunks.
pub enum ResponseBody {
    /// Body held in memory, served from storage.
    Full(Option<Bytes>),
    /// Transport body passed through untouched.
    Stream(BodyStream),
    /// Transport body forwarded while it is buffered for storage.
    Channel(mpsc::UnboundedReceiver<Result<Bytes, BoxError>>),
}

impl ResponseBody {
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        ResponseBody::Full((!bytes.is_empty()).then_some(bytes))
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
            ResponseBody::Channel(_) => f.write_str("Channel(..)"),
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            ResponseBody::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            ResponseBody::Stream(stream) => stream.poll_next_unpin(cx),
            ResponseBody::Channel(rx) => rx.poll_recv(cx),
        }
    }
}

/// A response delivered to the caller.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: String,
    /// True when the body came from storage, including after a successful revalidation.
    pub from_cache: bool,
    pub body: ResponseBody,
}

impl Response {
    /// Build a response from a stored entry, using `headers` in place of the stored ones.
    pub(crate) fn cached(entry: &CacheEntry, headers: HeaderMap) -> Result<Self, stow_core::Error> {
        Ok(Self {
            status: entry.status_code()?,
            headers,
            url: entry.url.clone(),
            from_cache: true,
            body: ResponseBody::full(entry.body.clone()),
        })
    }

    /// Read the whole body.
    ///
    /// # Errors
    ///
    /// Returns the error that interrupted the body, `Error::Aborted` when the request
    /// was aborted mid-body.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    return Err(match e.downcast::<Error>() {
                        Ok(inner) => *inner,
                        Err(other) => Error::Request(other),
                    });
                }
            }
        }
        Ok(buffer.freeze())
    }

    /// Read the whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
