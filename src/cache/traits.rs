//! Core types for the cache partitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::origin::{Request, Response};

/// Identity of a cached request: method plus URL (fragment stripped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self {
      method: request.method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Stable, fixed-length storage key.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response captured in a partition.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub partition: String,
  pub key: RequestKey,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  /// Live response from the origin
  Network,
  /// Stored copy from a cache partition
  Cache,
  /// Reserved offline page
  OfflineDocument,
  /// Built locally because neither network nor cache could answer
  Synthesized,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::for_request(&Request::get(url("/feed#top")));
    let b = RequestKey::for_request(&Request::get(url("/feed")));
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
  }

  #[test]
  fn test_key_distinguishes_method_and_query() {
    let get = RequestKey::for_request(&Request::get(url("/api/dashboard")));
    let post = RequestKey::for_request(&Request::new(reqwest::Method::POST, url("/api/dashboard")));
    let query = RequestKey::for_request(&Request::get(url("/api/dashboard?week=2")));
    assert_ne!(get.hash(), post.hash());
    assert_ne!(get.hash(), query.hash());
    assert!(get.is_get());
    assert!(!post.is_get());
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let key = RequestKey::for_request(&Request::get(url("/")));
    assert_eq!(key.hash().len(), 64);
  }
}
