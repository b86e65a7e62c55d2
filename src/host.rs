//! Side effects the agent asks its host to carry out.

use color_eyre::Result;
use serde::Serialize;
use std::future::Future;
use tracing::info;

use crate::push::NotificationDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
  /// Activate the new version without waiting for old pages to close
  SkipWaiting,
  /// Take control of every open page
  ClaimClients,
  ShowNotification(NotificationDescriptor),
  CloseNotification { tag: String },
  /// Focus a page already at `url`, or open one
  OpenWindow { url: String },
}

/// The environment the agent runs in.
pub trait Host: Send + Sync {
  fn skip_waiting(&self) -> impl Future<Output = Result<()>> + Send;

  fn claim_clients(&self) -> impl Future<Output = Result<()>> + Send;

  /// Resolves once the notification is on screen.
  fn show_notification(
    &self,
    notification: &NotificationDescriptor,
  ) -> impl Future<Output = Result<()>> + Send;

  fn close_notification(&self, tag: &str) -> impl Future<Output = Result<()>> + Send;

  fn open_window(&self, url: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Carry out effects in order, each finishing before the next starts.
pub async fn apply_effects<H: Host>(host: &H, effects: &[Effect]) -> Result<()> {
  for effect in effects {
    match effect {
      Effect::SkipWaiting => host.skip_waiting().await?,
      Effect::ClaimClients => host.claim_clients().await?,
      Effect::ShowNotification(notification) => host.show_notification(notification).await?,
      Effect::CloseNotification { tag } => host.close_notification(tag).await?,
      Effect::OpenWindow { url } => host.open_window(url).await?,
    }
  }
  Ok(())
}

/// Host for the command line: effects are logged and echoed to stderr.
pub struct ConsoleHost;

impl Host for ConsoleHost {
  fn skip_waiting(&self) -> impl Future<Output = Result<()>> + Send {
    info!("skip waiting");
    async { Ok(()) }
  }

  fn claim_clients(&self) -> impl Future<Output = Result<()>> + Send {
    info!("claiming clients");
    async { Ok(()) }
  }

  fn show_notification(
    &self,
    notification: &NotificationDescriptor,
  ) -> impl Future<Output = Result<()>> + Send {
    info!(tag = %notification.tag, title = %notification.title, "showing notification");
    eprintln!(
      "[{}] {}: {}",
      notification.tag, notification.title, notification.body
    );
    async { Ok(()) }
  }

  fn close_notification(&self, tag: &str) -> impl Future<Output = Result<()>> + Send {
    info!(tag, "closing notification");
    async { Ok(()) }
  }

  fn open_window(&self, url: &str) -> impl Future<Output = Result<()>> + Send {
    info!(url, "opening window");
    eprintln!("open {}", url);
    async { Ok(()) }
  }
}
