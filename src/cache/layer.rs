//! Cache store manager: versioned partitions, install and activate.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{Batch, CacheStorage};
use super::traits::{CachedResponse, RequestKey};
use crate::origin::{Network, Request, Response};

pub const INSTALLED_VERSION: &str = "installed_version";
pub const ACTIVE_VERSION: &str = "active_version";

/// Which of the three partitions of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
  /// Core app shell assets
  Core,
  /// Reserved offline document
  Offline,
  /// API responses
  Api,
}

/// Partition names for one version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions {
  pub version: String,
  pub core: String,
  pub offline: String,
  pub api: String,
}

impl Partitions {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      version: version.to_string(),
      core: format!("{}-core-{}", prefix, version),
      offline: format!("{}-offline-{}", prefix, version),
      api: format!("{}-api-{}", prefix, version),
    }
  }

  pub fn name(&self, kind: PartitionKind) -> &str {
    match kind {
      PartitionKind::Core => &self.core,
      PartitionKind::Offline => &self.offline,
      PartitionKind::Api => &self.api,
    }
  }

  pub fn all(&self) -> Vec<String> {
    vec![self.core.clone(), self.offline.clone(), self.api.clone()]
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.core || name == self.offline || name == self.api
  }
}

/// What install pre-cached.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub version: String,
  pub cached: Vec<String>,
}

/// What activate swept.
#[derive(Debug, Clone, Serialize)]
pub struct ActivateReport {
  pub version: String,
  pub evicted: Vec<String>,
}

/// Owns the current version's partitions and their lifecycle.
///
/// Every read goes through the current partition names, so entries from an
/// older version are unreachable even before activate deletes them.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  partitions: Partitions,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, partitions: Partitions) -> Self {
    Self {
      storage,
      partitions,
    }
  }

  pub fn partitions(&self) -> &Partitions {
    &self.partitions
  }

  /// Pre-cache the manifest.
  ///
  /// All assets are fetched before anything is written. A rejected fetch or
  /// a non-200 status fails the whole install and leaves storage untouched.
  pub async fn install<N: Network>(
    &self,
    network: &N,
    manifest: &[Url],
    offline_document: &Url,
  ) -> Result<InstallReport> {
    info!(version = %self.partitions.version, assets = manifest.len(), "installing");

    let mut fetched = Vec::with_capacity(manifest.len());
    for url in manifest {
      let request = Request::get(url.clone());
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Install failed fetching {}: {}", url, e))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Install failed: {} returned status {}",
          url,
          response.status
        ));
      }
      fetched.push((request, response));
    }

    let mut batch = Batch {
      partitions: self.partitions.all(),
      ..Batch::default()
    };
    let mut cached = Vec::with_capacity(fetched.len());
    for (request, response) in fetched {
      let kind = if &request.url == offline_document {
        PartitionKind::Offline
      } else {
        PartitionKind::Core
      };
      cached.push(request.url.to_string());
      batch.entries.push((
        self.partitions.name(kind).to_string(),
        RequestKey::for_request(&request),
        response,
      ));
    }
    batch
      .state
      .push((INSTALLED_VERSION.to_string(), self.partitions.version.clone()));

    self.storage.write_batch(&batch)?;

    info!(version = %self.partitions.version, cached = cached.len(), "installed");
    Ok(InstallReport {
      version: self.partitions.version.clone(),
      cached,
    })
  }

  /// Sweep every partition that does not belong to the current version.
  ///
  /// Refuses to run if the current version never finished installing.
  pub fn activate(&self) -> Result<ActivateReport> {
    let installed = self.storage.get_state(INSTALLED_VERSION)?;
    if installed.as_deref() != Some(self.partitions.version.as_str()) {
      return Err(eyre!(
        "Cannot activate {}: version is not installed (installed: {})",
        self.partitions.version,
        installed.as_deref().unwrap_or("none")
      ));
    }

    let mut evicted = Vec::new();
    for name in self.storage.partition_names()? {
      if self.partitions.is_current(&name) {
        continue;
      }
      if self.storage.delete_partition(&name)? {
        info!(partition = %name, "deleted stale cache partition");
        evicted.push(name);
      }
    }

    self
      .storage
      .set_state(ACTIVE_VERSION, &self.partitions.version)?;

    Ok(ActivateReport {
      version: self.partitions.version.clone(),
      evicted,
    })
  }

  /// Most recent stored response for the request in any current partition.
  ///
  /// Storage errors are logged and treated as a miss.
  pub fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    let key = RequestKey::for_request(request);
    match self.storage.lookup(&self.partitions.all(), &key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Store a response if it is a 200 answer to a GET.
  ///
  /// Returns whether it was stored. Storage errors are logged, not raised,
  /// since the live response is still good.
  pub fn store(&self, kind: PartitionKind, request: &Request, response: &Response) -> bool {
    let key = RequestKey::for_request(request);
    if !key.is_get() || !response.is_ok() {
      return false;
    }
    match self.storage.put(self.partitions.name(kind), &key, response) {
      Ok(()) => {
        debug!(url = %request.url, partition = self.partitions.name(kind), "cached");
        true
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "failed to cache response");
        false
      }
    }
  }

  /// The reserved offline document, if install stored it.
  pub fn offline_document(&self, url: &Url) -> Option<Response> {
    let key = RequestKey::for_request(&Request::get(url.clone()));
    match self
      .storage
      .lookup(std::slice::from_ref(&self.partitions.offline), &key)
    {
      Ok(hit) => hit.map(|cached| cached.response),
      Err(e) => {
        warn!(error = %e, "offline document lookup failed");
        None
      }
    }
  }

  /// Current partition names with their stored keys.
  pub fn contents(&self) -> Result<Vec<(String, Vec<RequestKey>)>> {
    self
      .storage
      .partition_names()?
      .into_iter()
      .map(|name| {
        let keys = self.storage.keys(&name)?;
        Ok((name, keys))
      })
      .collect()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      partitions: self.partitions.clone(),
    }
  }
}
