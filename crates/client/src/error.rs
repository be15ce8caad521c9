//! Client error taxonomy.
//!
//! - `Cache`: anything raised by storage or while reading stored cache metadata.
//! - `Request`: anything raised by the transport before a response was obtained,
//!   including malformed request URLs.
//! - `Aborted`: the caller aborted the request.

use stow_core::BoxError;

/// Errors surfaced by a cacheable request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage or cache metadata failure. Carries the original cause.
    #[error("{0}")]
    Cache(#[from] stow_core::Error),

    /// Transport failure. Carries the original cause.
    #[error("REQUEST_ERROR: {0}")]
    Request(#[source] BoxError),

    /// The caller aborted the request.
    #[error("REQUEST_ERROR: request aborted")]
    Aborted,
}

impl Error {
    /// Wrap a transport-side failure.
    pub fn request(err: impl Into<BoxError>) -> Self {
        Error::Request(err.into())
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Error::Cache(_))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Error::Request(_) | Error::Aborted)
    }
}
