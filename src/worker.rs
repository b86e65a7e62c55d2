//! The agent controller.
//!
//! `Worker` owns the configuration and every component. Each lifecycle or
//! platform event goes through `dispatch`, which picks the handler for the
//! event kind and returns an outcome plus the side effects the host must
//! apply. `run_event` does both inside one future: the host awaits it to
//! completion, and no work is spawned off that future.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  ActivateReport, CacheLayer, CacheStorage, InstallReport, Partitions, QueueStorage,
};
use crate::config::Config;
use crate::host::{apply_effects, Effect, Host};
use crate::origin::{Network, Request};
use crate::push::{click_target, ClickTarget, Interaction, NotificationDescriptor, NotificationState};
use crate::queue::{OfflineQueue, QueuePolicy};
use crate::router::{RouteTable, Strategy};
use crate::strategy::{FetchOutcome, FetchStrategies};
use crate::sync::{Replayer, SyncReport};

#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  Sync { tag: String },
  Push { data: Option<String> },
  NotificationClick { tag: String, action: Option<String> },
  NotificationClose { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Push,
  NotificationClick,
  NotificationClose,
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
      Event::Sync { .. } => EventKind::Sync,
      Event::Push { .. } => EventKind::Push,
      Event::NotificationClick { .. } => EventKind::NotificationClick,
      Event::NotificationClose { .. } => EventKind::NotificationClose,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Fetched {
    strategy: Strategy,
    #[serde(flatten)]
    result: FetchOutcome,
  },
  Synced(SyncReport),
  /// Sync tag that is not ours
  SyncIgnored { tag: String },
  Notified { tag: String },
  Clicked { tag: String, state: NotificationState },
  Closed { tag: String },
}

/// What a handler produced.
#[derive(Debug, Clone, Serialize)]
pub struct Handled {
  pub outcome: Outcome,
  pub effects: Vec<Effect>,
}

impl Handled {
  fn new(outcome: Outcome) -> Self {
    Self {
      outcome,
      effects: Vec::new(),
    }
  }

  fn with_effects(outcome: Outcome, effects: Vec<Effect>) -> Self {
    Self { outcome, effects }
  }
}

/// Notifications remembered at once; the oldest is forgotten first.
const TRACKED_NOTIFICATIONS: usize = 256;

/// A notification shown by this process. Finished ones stay tracked so
/// repeated interactions can be rejected.
#[derive(Debug, Clone)]
struct Shown {
  state: NotificationState,
  deep_link: String,
  /// Insertion order, for eviction
  seq: u64,
}

pub struct Worker<S, N>
where
  S: CacheStorage + QueueStorage,
  N: Network,
{
  config: Config,
  origin: Url,
  manifest: Vec<Url>,
  offline_document: Url,
  network: Arc<N>,
  routes: RouteTable,
  cache: CacheLayer<S>,
  queue: OfflineQueue<S>,
  strategies: FetchStrategies<S, N>,
  replayer: Replayer<S, N>,
  notifications: Mutex<HashMap<String, Shown>>,
  next_notification: AtomicU64,
}

impl<S, N> Worker<S, N>
where
  S: CacheStorage + QueueStorage,
  N: Network,
{
  pub fn new(config: Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    config.validate()?;
    let origin = config.origin_url()?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid path {}: {}", path, e))
    };

    let manifest = config
      .manifest
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;
    let offline_document = resolve(&config.offline_document)?;

    let partitions = Partitions::new(&config.cache.prefix, &config.cache.version);
    let cache = CacheLayer::new(Arc::clone(&storage), partitions);
    let policy = QueuePolicy {
      max_entries: config.sync.max_entries,
      max_attempts: config.sync.max_attempts,
    };
    let queue = OfflineQueue::new(storage, policy, &config.sync.replay_endpoint);
    let strategies = FetchStrategies::new(
      cache.clone(),
      queue.clone(),
      Arc::clone(&network),
      offline_document.clone(),
    );
    let replayer = Replayer::new(queue.clone(), Arc::clone(&network), origin.clone());

    Ok(Self {
      routes: RouteTable::from_config(&config),
      config,
      origin,
      manifest,
      offline_document,
      network,
      cache,
      queue,
      strategies,
      replayer,
      notifications: Mutex::new(HashMap::new()),
      next_notification: AtomicU64::new(1),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue<S> {
    &self.queue
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Handle one event and return what the host must do about it.
  pub async fn dispatch(&self, event: Event) -> Result<Handled> {
    debug!(kind = ?event.kind(), "dispatching event");
    match event {
      Event::Install => self.on_install().await,
      Event::Activate => self.on_activate(),
      Event::Fetch(request) => Ok(self.on_fetch(&request).await),
      Event::Sync { tag } => self.on_sync(tag).await,
      Event::Push { data } => self.on_push(data.as_deref()),
      Event::NotificationClick { tag, action } => self.on_click(tag, action),
      Event::NotificationClose { tag } => self.on_close(tag),
    }
  }

  /// Dispatch and apply the resulting effects; the returned future covers
  /// all of the event's work.
  pub async fn run_event<H: Host>(&self, host: &H, event: Event) -> Result<Handled> {
    let handled = self.dispatch(event).await?;
    apply_effects(host, &handled.effects).await?;
    Ok(handled)
  }

  async fn on_install(&self) -> Result<Handled> {
    let report = self
      .cache
      .install(self.network.as_ref(), &self.manifest, &self.offline_document)
      .await?;
    Ok(Handled::with_effects(
      Outcome::Installed(report),
      vec![Effect::SkipWaiting],
    ))
  }

  fn on_activate(&self) -> Result<Handled> {
    let report = self.cache.activate()?;
    info!(version = %report.version, evicted = report.evicted.len(), "activated");
    Ok(Handled::with_effects(
      Outcome::Activated(report),
      vec![Effect::ClaimClients],
    ))
  }

  async fn on_fetch(&self, request: &Request) -> Handled {
    let strategy = self.routes.classify(request);
    debug!(method = %request.method, path = %request.path_and_query(), ?strategy, "routed request");
    let result = self.strategies.handle(strategy, request).await;
    Handled::new(Outcome::Fetched { strategy, result })
  }

  async fn on_sync(&self, tag: String) -> Result<Handled> {
    if tag != self.config.sync.tag {
      debug!(%tag, "ignoring sync for unknown tag");
      return Ok(Handled::new(Outcome::SyncIgnored { tag }));
    }
    let report = self.replayer.drain().await?;
    Ok(Handled::new(Outcome::Synced(report)))
  }

  fn on_push(&self, data: Option<&str>) -> Result<Handled> {
    let seq = self.next_notification.fetch_add(1, Ordering::SeqCst);
    let tag = format!("echodeed-{}-{}", chrono::Utc::now().timestamp_millis(), seq);
    let mut notification =
      NotificationDescriptor::from_push(data, &self.config.notifications, tag.clone());

    let deep_link = self.deep_link(notification.url.as_deref());
    notification.url = Some(deep_link.clone());

    let mut shown = self.lock_notifications()?;
    remember(
      &mut shown,
      tag.clone(),
      Shown {
        state: NotificationState::Displayed,
        deep_link,
        seq,
      },
    );
    drop(shown);

    info!(%tag, "push received");
    Ok(Handled::with_effects(
      Outcome::Notified { tag },
      vec![Effect::ShowNotification(notification)],
    ))
  }

  /// Target of the `explore` action. A payload link is only honoured when it
  /// stays on the origin.
  fn deep_link(&self, requested: Option<&str>) -> String {
    let fallback = &self.config.notifications.explore_url;
    let Some(requested) = requested else {
      return fallback.clone();
    };

    match self.origin.join(requested) {
      Ok(url) if url.origin() == self.origin.origin() => url.to_string(),
      Ok(url) => {
        warn!(%url, "push deep link leaves the origin, using explore_url");
        fallback.clone()
      }
      Err(e) => {
        warn!(link = requested, error = %e, "invalid push deep link, using explore_url");
        fallback.clone()
      }
    }
  }

  /// Clicks on a finished notification are rejected. A tag this process never
  /// showed counts as displayed.
  fn on_click(&self, tag: String, action: Option<String>) -> Result<Handled> {
    let mut shown = self.lock_notifications()?;
    let current = match shown.get(&tag) {
      Some(current) => current.clone(),
      None => Shown {
        state: NotificationState::Displayed,
        deep_link: self.config.notifications.explore_url.clone(),
        seq: self.next_notification.fetch_add(1, Ordering::SeqCst),
      },
    };

    let state = current
      .state
      .apply(&Interaction::Click {
        action: action.clone(),
      })
      .map_err(|e| eyre!("Click on {} rejected: {}", tag, e))?;
    remember(
      &mut shown,
      tag.clone(),
      Shown {
        state: state.clone(),
        ..current.clone()
      },
    );
    drop(shown);

    let mut effects = vec![Effect::CloseNotification { tag: tag.clone() }];
    match click_target(action.as_deref(), &current.deep_link) {
      ClickTarget::DeepLink(link) => effects.push(Effect::OpenWindow {
        url: self.resolve(&link)?.to_string(),
      }),
      ClickTarget::Root => effects.push(Effect::OpenWindow {
        url: self.resolve("/")?.to_string(),
      }),
      ClickTarget::Nothing => {}
    }

    info!(%tag, ?state, "notification clicked");
    Ok(Handled::with_effects(Outcome::Clicked { tag, state }, effects))
  }

  /// A close after the notification already finished changes nothing.
  fn on_close(&self, tag: String) -> Result<Handled> {
    let mut shown = self.lock_notifications()?;
    if let Some(current) = shown.get_mut(&tag) {
      match current.state.apply(&Interaction::Dismiss) {
        Ok(state) => {
          debug!(%tag, ?state, "notification dismissed");
          current.state = state;
        }
        Err(e) => debug!(%tag, error = %e, "close ignored"),
      }
    }
    Ok(Handled::new(Outcome::Closed { tag }))
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  fn lock_notifications(&self) -> Result<MutexGuard<'_, HashMap<String, Shown>>> {
    self
      .notifications
      .lock()
      .map_err(|e| eyre!("Notification table poisoned: {}", e))
  }
}

/// Insert or update a tracked notification, evicting the oldest one when the
/// table is full.
fn remember(table: &mut HashMap<String, Shown>, tag: String, shown: Shown) {
  if !table.contains_key(&tag) && table.len() >= TRACKED_NOTIFICATIONS {
    let oldest = table
      .iter()
      .min_by_key(|(_, s)| s.seq)
      .map(|(tag, _)| tag.clone());
    if let Some(oldest) = oldest {
      debug!(tag = %oldest, "evicting tracked notification");
      table.remove(&oldest);
    }
  }
  table.insert(tag, shown);
}
