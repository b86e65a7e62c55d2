//! Fetch strategies.
//!
//! Every strategy resolves to a response or declines to intercept; network
//! failures end in a cached copy, the offline document or a synthesized
//! offline response, never in an error.

use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, PartitionKind, QueueStorage, ResponseSource};
use crate::origin::{Network, Request, Response, ResponseSummary};
use crate::queue::OfflineQueue;
use crate::router::Strategy;

/// Served for offline navigations when install never stored the offline page.
const FALLBACK_OFFLINE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>EchoDeed - Offline</title></head><body><h1>You're offline</h1>\
<p>Your kindness still counts. Reconnect to see the latest posts.</p></body></html>";

const OFFLINE_TEXT: &str = "Offline: this resource is not available without a connection";

/// Result of running a strategy.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchOutcome {
  /// Not intercepted; the host sends the request to the network itself
  Passthrough,
  /// Not intercepted; the host applies its default handling
  Ignored,
  Respond {
    #[serde(serialize_with = "summarize")]
    response: Response,
    source: ResponseSource,
  },
}

impl FetchOutcome {
  fn respond(response: Response, source: ResponseSource) -> Self {
    Self::Respond { response, source }
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Respond { response, .. } => Some(response),
      _ => None,
    }
  }

  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      Self::Respond { source, .. } => Some(*source),
      _ => None,
    }
  }
}

fn summarize<S: Serializer>(response: &Response, serializer: S) -> Result<S::Ok, S::Error> {
  ResponseSummary::from(response).serialize(serializer)
}

/// The strategy implementations, sharing the cache and queue.
pub struct FetchStrategies<S, N>
where
  S: CacheStorage + QueueStorage,
  N: Network,
{
  cache: CacheLayer<S>,
  queue: OfflineQueue<S>,
  network: Arc<N>,
  offline_document: Url,
}

impl<S, N> FetchStrategies<S, N>
where
  S: CacheStorage + QueueStorage,
  N: Network,
{
  pub fn new(
    cache: CacheLayer<S>,
    queue: OfflineQueue<S>,
    network: Arc<N>,
    offline_document: Url,
  ) -> Self {
    Self {
      cache,
      queue,
      network,
      offline_document,
    }
  }

  pub async fn handle(&self, strategy: Strategy, request: &Request) -> FetchOutcome {
    match strategy {
      Strategy::Passthrough => FetchOutcome::Passthrough,
      Strategy::Ignore => FetchOutcome::Ignored,
      Strategy::Api => self.api(request).await,
      Strategy::Navigation => self.navigation(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  /// Network, store 200s in the core partition; fall back to the cache.
  pub async fn network_first(&self, request: &Request) -> FetchOutcome {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.cache.store(PartitionKind::Core, request, &response);
        FetchOutcome::respond(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        match self.cache.lookup(request) {
          Some(cached) => FetchOutcome::respond(cached.response, ResponseSource::Cache),
          None => self.offline_fallback(request),
        }
      }
    }
  }

  /// Cache, then an uncached network fetch.
  pub async fn cache_first(&self, request: &Request) -> FetchOutcome {
    if let Some(cached) = self.cache.lookup(request) {
      return FetchOutcome::respond(cached.response, ResponseSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => FetchOutcome::respond(response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, error = %e, "cache miss and network failed");
        self.offline_fallback(request)
      }
    }
  }

  /// Network, store 200s in the API partition; fall back to the cache, then
  /// to a structured offline body.
  pub async fn api(&self, request: &Request) -> FetchOutcome {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.cache.store(PartitionKind::Api, request, &response);
        FetchOutcome::respond(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "API unreachable, trying cache");
        match self.cache.lookup(request) {
          Some(cached) => FetchOutcome::respond(cached.response, ResponseSource::Cache),
          None => FetchOutcome::respond(self.offline_api_response(request), ResponseSource::Synthesized),
        }
      }
    }
  }

  /// Network; any failure serves the offline document.
  pub async fn navigation(&self, request: &Request) -> FetchOutcome {
    match self.network.fetch(request).await {
      Ok(response) => FetchOutcome::respond(response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, error = %e, "navigation failed, serving offline page");
        self.offline_page()
      }
    }
  }

  fn offline_fallback(&self, request: &Request) -> FetchOutcome {
    if request.accepts_html() {
      self.offline_page()
    } else {
      FetchOutcome::respond(Response::text(503, OFFLINE_TEXT), ResponseSource::Synthesized)
    }
  }

  fn offline_page(&self) -> FetchOutcome {
    match self.cache.offline_document(&self.offline_document) {
      Some(response) => FetchOutcome::respond(response, ResponseSource::OfflineDocument),
      None => FetchOutcome::respond(
        Response::html(503, FALLBACK_OFFLINE_HTML),
        ResponseSource::Synthesized,
      ),
    }
  }

  fn offline_api_response(&self, request: &Request) -> Response {
    let path = request.url.path();
    let mut body = json!({
      "offline": true,
      "error": "Network unavailable",
      "message": "You're offline. This will update when your connection is back.",
      "path": path,
    });

    if path == self.queue.kindness_endpoint() {
      match self.queue.pending_payloads(path) {
        Ok(queued) => body["queued"] = Value::Array(queued),
        Err(e) => warn!(error = %e, "failed to read offline queue"),
      }
    }

    Response::json(503, &body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Partitions, SqliteStorage};
  use crate::queue::QueuePolicy;
  use crate::testing::{url, FakeNetwork};

  struct Fixture {
    network: Arc<FakeNetwork>,
    cache: CacheLayer<SqliteStorage>,
    queue: OfflineQueue<SqliteStorage>,
    strategies: FetchStrategies<SqliteStorage, FakeNetwork>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let cache = CacheLayer::new(Arc::clone(&storage), Partitions::new("echodeed", "v1"));
    let queue = OfflineQueue::new(storage, QueuePolicy::default(), "/api/kindness-posts");
    let strategies = FetchStrategies::new(
      cache.clone(),
      queue.clone(),
      Arc::clone(&network),
      url("/offline.html"),
    );
    Fixture {
      network,
      cache,
      queue,
      strategies,
    }
  }

  fn body(outcome: &FetchOutcome) -> Value {
    serde_json::from_slice(&outcome.response().unwrap().body).unwrap()
  }

  #[tokio::test]
  async fn test_network_first_stores_and_serves_cache_offline() {
    let f = fixture();
    let mut live = Response::new(200, "text/css", "body{}");
    live.headers.push(("etag".to_string(), "\"1\"".to_string()));
    f.network.get("/style.css", live.clone());
    let request = Request::get(url("/style.css"));

    let online = f.strategies.network_first(&request).await;
    assert_eq!(online.source(), Some(ResponseSource::Network));

    f.network.set_offline(true);
    let offline = f.strategies.network_first(&request).await;
    assert_eq!(offline.source(), Some(ResponseSource::Cache));
    assert_eq!(offline.response(), Some(&live));
  }

  #[tokio::test]
  async fn test_network_first_serves_latest_stored_copy() {
    let f = fixture();
    let request = Request::get(url("/api/dashboard"));
    f.network.get("/api/dashboard", Response::text(200, "first"));
    f.strategies.network_first(&request).await;
    f.network.get("/api/dashboard", Response::text(200, "second"));
    f.strategies.network_first(&request).await;

    f.network.set_offline(true);
    let outcome = f.strategies.network_first(&request).await;
    assert_eq!(outcome.response().unwrap().body_text(), "second");
  }

  #[tokio::test]
  async fn test_network_first_does_not_store_errors() {
    let f = fixture();
    f.network.get("/missing.js", Response::text(404, "nope"));
    let request = Request::get(url("/missing.js"));

    let outcome = f.strategies.network_first(&request).await;
    assert_eq!(outcome.response().unwrap().status, 404);
    assert!(f.cache.lookup(&request).is_none());
  }

  #[tokio::test]
  async fn test_network_first_html_falls_back_to_offline_document() {
    let f = fixture();
    f.cache.store(
      PartitionKind::Offline,
      &Request::get(url("/offline.html")),
      &Response::html(200, "offline page"),
    );
    f.network.set_offline(true);

    let request = Request::get(url("/about")).with_header("accept", "text/html");
    let outcome = f.strategies.network_first(&request).await;
    assert_eq!(outcome.source(), Some(ResponseSource::OfflineDocument));
    assert_eq!(outcome.response().unwrap().body_text(), "offline page");
  }

  #[tokio::test]
  async fn test_network_first_non_html_gets_synthesized_503() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = f.strategies.network_first(&Request::get(url("/data.bin"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Synthesized));
    assert_eq!(outcome.response().unwrap().status, 503);
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let f = fixture();
    let request = Request::get(url("/icon-192.png"));
    f.cache.store(PartitionKind::Core, &request, &Response::new(200, "image/png", vec![7u8]));

    let outcome = f.strategies.cache_first(&request).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    assert!(f.network.requests().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_miss_is_not_stored() {
    let f = fixture();
    f.network.get("/app.js", Response::new(200, "text/javascript", "x"));
    let request = Request::get(url("/app.js"));

    let outcome = f.strategies.cache_first(&request).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert!(f.cache.lookup(&request).is_none());
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_is_structured_503() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = f.strategies.api(&Request::get(url("/api/kindness-posts"))).await;
    let response = outcome.response().unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.content_type(), Some("application/json"));
    let body = body(&outcome);
    assert_eq!(body["offline"], json!(true));
    assert_eq!(body["queued"], json!([]));
  }

  #[tokio::test]
  async fn test_api_offline_includes_queued_kindness_posts() {
    let f = fixture();
    f.queue
      .enqueue_kindness(r#"{"content":"Shared my lunch"}"#)
      .unwrap();
    f.network.set_offline(true);

    let outcome = f.strategies.api(&Request::get(url("/api/kindness-posts"))).await;
    assert_eq!(body(&outcome)["queued"], json!([{"content": "Shared my lunch"}]));
  }

  #[tokio::test]
  async fn test_api_offline_other_endpoint_has_no_queue() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = f.strategies.api(&Request::get(url("/api/dashboard"))).await;
    let body = body(&outcome);
    assert_eq!(body["offline"], json!(true));
    assert!(body.get("queued").is_none());
  }

  #[tokio::test]
  async fn test_api_falls_back_to_cached_entry() {
    let f = fixture();
    f.network.get("/api/certificates", Response::json(200, &json!({"count": 3})));
    let request = Request::get(url("/api/certificates"));
    f.strategies.api(&request).await;

    f.network.set_offline(true);
    let outcome = f.strategies.api(&request).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    assert_eq!(body(&outcome), json!({"count": 3}));
  }

  #[tokio::test]
  async fn test_navigation_offline_ignores_cached_page() {
    let f = fixture();
    let request = Request::navigate(url("/feed"));
    f.cache.store(PartitionKind::Core, &request, &Response::html(200, "cached feed"));
    f.cache.store(
      PartitionKind::Offline,
      &Request::get(url("/offline.html")),
      &Response::html(200, "offline page"),
    );
    f.network.set_offline(true);

    let outcome = f.strategies.navigation(&request).await;
    assert_eq!(outcome.source(), Some(ResponseSource::OfflineDocument));
    assert_eq!(outcome.response().unwrap().body_text(), "offline page");
  }

  #[tokio::test]
  async fn test_navigation_without_installed_offline_page() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = f.strategies.navigation(&Request::navigate(url("/"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Synthesized));
    assert!(outcome.response().unwrap().body_text().contains("offline"));
  }

  #[tokio::test]
  async fn test_passthrough_and_ignore_do_not_touch_network() {
    let f = fixture();
    let post = Request::new(reqwest::Method::POST, url("/api/kindness-posts"));
    assert!(matches!(
      f.strategies.handle(Strategy::Passthrough, &post).await,
      FetchOutcome::Passthrough
    ));
    assert!(matches!(
      f.strategies.handle(Strategy::Ignore, &post).await,
      FetchOutcome::Ignored
    ));
    assert!(f.network.requests().is_empty());
  }
}
