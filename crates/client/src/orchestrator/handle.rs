//! Caller-facing view of one in-flight request.

use http::{HeaderMap, Method};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{Error, Response};

/// What was handed to the transport.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

/// Handle to a request running on its own task.
///
/// The request keeps running when the handle is dropped; only [`RequestHandle::abort`]
/// stops it.
#[derive(Debug)]
pub struct RequestHandle {
    pub(super) dispatched: Option<oneshot::Receiver<Dispatched>>,
    pub(super) outcome: Option<oneshot::Receiver<Result<Response, Error>>>,
    pub(super) notices: mpsc::UnboundedReceiver<Error>,
    pub(super) abort: watch::Sender<bool>,
    pub(super) task: Option<JoinHandle<()>>,
}

impl RequestHandle {
    /// Wait until the transport has been called.
    ///
    /// Resolves to `None` when the request finishes without a network call, such as a
    /// fresh cache hit or a failed lookup.
    pub async fn dispatched(&mut self) -> Option<Dispatched> {
        self.dispatched.take()?.await.ok()
    }

    /// Wait for the terminal outcome. It is produced exactly once; later calls fail.
    pub async fn response(&mut self) -> Result<Response, Error> {
        let Some(outcome) = self.outcome.take() else {
            return Err(Error::request("response already taken"));
        };
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(Error::request("request task ended without a response")),
        }
    }

    /// Abort the request. Nothing is stored afterwards.
    pub fn abort(&self) {
        self.abort.send_replace(true);
    }

    /// Next non-fatal cache error, or `None` once the request has finished.
    pub async fn next_notice(&mut self) -> Option<Error> {
        self.notices.recv().await
    }

    /// Wait for all background storage work and collect the pending notices.
    pub async fn settled(mut self) -> Vec<Error> {
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Request task failed");
        }

        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}
