//! Background sync replayer.
//!
//! A sync event drains the offline queue one entry at a time, in queue
//! order. Delivered entries are removed; failed ones stay for the next sync.
//! Neither a failed replay nor a storage error on one entry stops the pass.
//! Replays are not idempotent: if the origin applied a write but the
//! response was lost, the next drain submits it again.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::QueueStorage;
use crate::origin::{Network, Request};
use crate::queue::{MutationStatus, OfflineQueue, QueuedMutation};

/// Summary of one drain, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub replayed: usize,
  pub retained: usize,
  pub dead_lettered: usize,
  /// Another drain was already running
  pub skipped: bool,
}

/// Resets the draining flag even if the drain future is dropped midway.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct Replayer<S: QueueStorage, N: Network> {
  queue: OfflineQueue<S>,
  network: Arc<N>,
  origin: Url,
  draining: AtomicBool,
}

impl<S: QueueStorage, N: Network> Replayer<S, N> {
  pub fn new(queue: OfflineQueue<S>, network: Arc<N>, origin: Url) -> Self {
    Self {
      queue,
      network,
      origin,
      draining: AtomicBool::new(false),
    }
  }

  #[cfg(test)]
  fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Replay every pending entry once.
  ///
  /// A drain that starts while another is running is skipped so the same
  /// entry is never in flight twice.
  pub async fn drain(&self) -> Result<SyncReport> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      info!("sync already draining, skipping");
      return Ok(SyncReport {
        skipped: true,
        ..SyncReport::default()
      });
    }
    let _guard = DrainGuard(&self.draining);

    let entries = self.queue.entries()?;
    info!(pending = entries.len(), "draining offline queue");

    let mut report = SyncReport::default();
    for entry in entries {
      report.attempted += 1;
      match self.replay(&entry).await {
        Ok(()) => {
          report.replayed += 1;
          info!(id = entry.id, path = %entry.path, "replayed queued mutation");
          if let Err(e) = self.queue.remove(entry.id) {
            warn!(id = entry.id, error = %e, "delivered but could not remove queued mutation");
          }
        }
        Err(e) => {
          warn!(id = entry.id, path = %entry.path, error = %e, "replay failed, keeping entry");
          match self.queue.record_failure(entry.id, &e.to_string()) {
            Ok(MutationStatus::Pending) => report.retained += 1,
            Ok(MutationStatus::DeadLettered) => {
              warn!(id = entry.id, "giving up on queued mutation");
              report.dead_lettered += 1;
            }
            Err(e) => {
              warn!(id = entry.id, error = %e, "could not record replay failure");
              report.retained += 1;
            }
          }
        }
      }
    }

    info!(
      replayed = report.replayed,
      retained = report.retained,
      dead_lettered = report.dead_lettered,
      "offline queue drained"
    );
    Ok(report)
  }

  async fn replay(&self, entry: &QueuedMutation) -> Result<()> {
    let method = Method::from_bytes(entry.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", entry.method, e))?;
    let url = self
      .origin
      .join(&entry.path)
      .map_err(|e| eyre!("Invalid path {}: {}", entry.path, e))?;

    let request = Request::new(method, url)
      .with_header("content-type", "application/json")
      .with_body(entry.body.as_bytes());

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("origin answered {}", response.status));
    }
    Ok(())
  }
}
