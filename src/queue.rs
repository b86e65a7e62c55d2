//! Offline mutation queue.
//!
//! Writes the page could not deliver are kept here until a background sync
//! replays them. Entries are keyed by a generated id; identical submissions
//! are separate entries and each is replayed once per drain.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::QueueStorage;

/// A write waiting to be stored.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub method: String,
  pub path: String,
  /// Serialized JSON body
  pub body: String,
}

impl NewMutation {
  pub fn post(path: &str, body: &str) -> Self {
    Self {
      method: "POST".to_string(),
      path: path.to_string(),
      body: body.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  /// Waiting for the next sync
  Pending,
  /// Gave up after the configured number of attempts; kept for inspection
  DeadLettered,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::DeadLettered => "dead",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "dead" => Ok(Self::DeadLettered),
      other => Err(eyre!("Unknown mutation status: {}", other)),
    }
  }
}

/// A stored write.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub method: String,
  pub path: String,
  pub body: String,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub status: MutationStatus,
}

/// Retention policy. The defaults keep everything and retry forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePolicy {
  pub max_entries: Option<usize>,
  pub max_attempts: Option<u32>,
}

/// Offline queue over durable storage.
pub struct OfflineQueue<S: QueueStorage> {
  storage: Arc<S>,
  policy: QueuePolicy,
  /// Endpoint kindness posts are queued for
  kindness_endpoint: String,
}

impl<S: QueueStorage> OfflineQueue<S> {
  pub fn new(storage: Arc<S>, policy: QueuePolicy, kindness_endpoint: &str) -> Self {
    Self {
      storage,
      policy,
      kindness_endpoint: kindness_endpoint.to_string(),
    }
  }

  pub fn kindness_endpoint(&self) -> &str {
    &self.kindness_endpoint
  }

  /// Store a write for later replay.
  ///
  /// The body must be valid JSON. Fails when the queue is at its cap.
  pub fn enqueue(&self, mutation: NewMutation) -> Result<i64> {
    serde_json::from_str::<serde_json::Value>(&mutation.body)
      .map_err(|e| eyre!("Queued body for {} is not JSON: {}", mutation.path, e))?;

    if let Some(max) = self.policy.max_entries {
      let pending = self.storage.pending_count()?;
      if pending >= max {
        warn!(pending, max, path = %mutation.path, "offline queue full");
        return Err(eyre!(
          "Offline queue is full ({} pending, cap {})",
          pending,
          max
        ));
      }
    }

    let id = self.storage.enqueue(&mutation)?;
    info!(id, method = %mutation.method, path = %mutation.path, "queued offline mutation");
    Ok(id)
  }

  /// Queue a kindness post for the replay endpoint.
  pub fn enqueue_kindness(&self, body: &str) -> Result<i64> {
    self.enqueue(NewMutation::post(&self.kindness_endpoint, body))
  }

  /// Pending ids in replay order.
  pub fn keys(&self) -> Result<Vec<i64>> {
    Ok(self.storage.pending()?.into_iter().map(|m| m.id).collect())
  }

  pub fn entries(&self) -> Result<Vec<QueuedMutation>> {
    self.storage.pending()
  }

  pub fn get(&self, id: i64) -> Result<Option<QueuedMutation>> {
    self.storage.mutation(id)
  }

  pub fn remove(&self, id: i64) -> Result<bool> {
    self.storage.remove_mutation(id)
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.pending_count()
  }

  /// Record a failed replay; returns the entry's resulting status.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<MutationStatus> {
    self
      .storage
      .record_failure(id, error, self.policy.max_attempts)
  }

  pub fn dead_letters(&self) -> Result<Vec<QueuedMutation>> {
    self.storage.dead_letters()
  }

  /// Pending bodies for `path`, parsed back into JSON.
  pub fn pending_payloads(&self, path: &str) -> Result<Vec<serde_json::Value>> {
    Ok(
      self
        .storage
        .pending()?
        .into_iter()
        .filter(|m| m.path == path)
        .filter_map(|m| serde_json::from_str(&m.body).ok())
        .collect(),
    )
  }
}

impl<S: QueueStorage> Clone for OfflineQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      policy: self.policy,
      kindness_endpoint: self.kindness_endpoint.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;

  fn queue(policy: QueuePolicy) -> OfflineQueue<SqliteStorage> {
    OfflineQueue::new(
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      policy,
      "/api/kindness-posts",
    )
  }

  #[test]
  fn test_duplicates_are_separate_entries() {
    let queue = queue(QueuePolicy::default());
    let body = r#"{"content":"Helped a classmate with homework"}"#;
    let a = queue.enqueue_kindness(body).unwrap();
    let b = queue.enqueue_kindness(body).unwrap();

    assert_ne!(a, b);
    assert_eq!(queue.keys().unwrap(), vec![a, b]);
    assert_eq!(queue.get(a).unwrap().unwrap().body, body);
  }

  #[test]
  fn test_rejects_non_json_body() {
    let queue = queue(QueuePolicy::default());
    assert!(queue.enqueue_kindness("not json").is_err());
    assert_eq!(queue.len().unwrap(), 0);
  }

  #[test]
  fn test_cap_rejects_new_entries() {
    let queue = queue(QueuePolicy {
      max_entries: Some(1),
      max_attempts: None,
    });
    queue.enqueue_kindness("{}").unwrap();
    let err = queue.enqueue_kindness("{}").unwrap_err();
    assert!(err.to_string().contains("full"));
  }

  #[test]
  fn test_unbounded_retries_by_default() {
    let queue = queue(QueuePolicy::default());
    let id = queue.enqueue_kindness("{}").unwrap();
    for _ in 0..10 {
      assert_eq!(queue.record_failure(id, "offline").unwrap(), MutationStatus::Pending);
    }
    assert_eq!(queue.get(id).unwrap().unwrap().attempts, 10);
  }

  #[test]
  fn test_pending_payloads_filters_by_path() {
    let queue = queue(QueuePolicy::default());
    queue.enqueue_kindness(r#"{"content":"a"}"#).unwrap();
    queue
      .enqueue(NewMutation::post("/api/wellness-checkin", r#"{"mood":"ok"}"#))
      .unwrap();

    let payloads = queue.pending_payloads("/api/kindness-posts").unwrap();
    assert_eq!(payloads, vec![serde_json::json!({"content": "a"})]);
  }

  #[test]
  fn test_remove() {
    let queue = queue(QueuePolicy::default());
    let id = queue.enqueue_kindness("{}").unwrap();
    assert!(queue.remove(id).unwrap());
    assert!(!queue.remove(id).unwrap());
    assert!(queue.keys().unwrap().is_empty());
  }
}
