//! Cache-aware HTTP requests for stow.
//!
//! This crate wraps an injected transport with RFC 7234 response caching: the policy
//! oracle, the orchestrator and the handle callers use to follow a request.

pub mod error;
pub mod options;
pub mod orchestrator;
pub mod policy;
pub mod response;
pub mod transport;

pub use error::Error;
pub use options::CacheOptions;
pub use orchestrator::{CacheableRequest, Dispatched, RequestHandle, RequestInput};
pub use policy::{Decision, Freshness, PolicyOracle, Revalidation, SemanticsOracle};
pub use response::{Response, ResponseBody};
pub use transport::{HttpTransport, OutgoingRequest, Transport, TransportConfig, TransportResponse};

pub use stow_core::{CacheConfig, RequestDescriptor, Storage};
