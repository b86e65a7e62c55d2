//! Request/response model and network access to the EchoDeed origin.
//!
//! Everything behind the origin (posts, dashboards, certificates) is opaque;
//! the agent only sees requests going out and responses coming back.

mod client;
mod types;

use color_eyre::Result;
use std::future::Future;

pub use client::OriginClient;
pub use types::{path_and_query, Request, RequestMode, Response, ResponseSummary};

/// Something that can perform a network fetch.
///
/// An `Err` means the fetch itself failed (no connectivity, DNS, reset).
/// HTTP error statuses are returned as `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}
