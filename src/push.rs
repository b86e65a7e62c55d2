//! Push payloads, notification descriptors and click routing.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::NotificationConfig;

pub const ACTION_EXPLORE: &str = "explore";
pub const ACTION_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

/// What to display for one push. Built per event and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationDescriptor {
  pub tag: String,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Deep link for the `explore` action, if the payload named one
  pub url: Option<String>,
  pub actions: Vec<NotificationAction>,
  pub arrived_at: DateTime<Utc>,
}

/// Fields a JSON push payload may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Read a push payload. Never fails: a JSON object is read field by
  /// field, other text becomes the body, and an object that does not parse
  /// yields the defaults.
  pub fn parse(data: Option<&str>) -> Self {
    let text = match data.map(str::trim) {
      Some(t) if !t.is_empty() => t,
      _ => return Self::default(),
    };

    if !text.starts_with('{') {
      return Self {
        body: Some(text.to_string()),
        ..Self::default()
      };
    }

    serde_json::from_str::<PushPayload>(text).unwrap_or_else(|e| {
      warn!(error = %e, "malformed push payload, using defaults");
      Self::default()
    })
  }
}

impl NotificationDescriptor {
  pub fn from_push(data: Option<&str>, config: &NotificationConfig, tag: String) -> Self {
    let payload = PushPayload::parse(data);

    Self {
      tag,
      title: non_empty(payload.title).unwrap_or_else(|| config.title.clone()),
      body: non_empty(payload.body).unwrap_or_else(|| config.default_body.clone()),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: vec![100, 50, 100],
      url: non_empty(payload.url),
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "View kindness".to_string(),
          icon: config.icon.clone(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
          icon: config.icon.clone(),
        },
      ],
      arrived_at: Utc::now(),
    }
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}

/// Lifecycle of one displayed notification. Every state but `Displayed` is
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "action", rename_all = "snake_case")]
pub enum NotificationState {
  Displayed,
  Dismissed,
  ActionInvoked(String),
  /// Body click
  Opened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
  /// Closed without clicking
  Dismiss,
  Click { action: Option<String> },
}

impl NotificationState {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, Self::Displayed)
  }

  pub fn apply(&self, interaction: &Interaction) -> Result<Self> {
    if self.is_terminal() {
      return Err(eyre!("Notification already finished: {:?}", self));
    }

    Ok(match interaction {
      Interaction::Dismiss => Self::Dismissed,
      Interaction::Click { action } => match action.as_deref() {
        Some(ACTION_EXPLORE) => Self::ActionInvoked(ACTION_EXPLORE.to_string()),
        Some(ACTION_CLOSE) => Self::ActionInvoked(ACTION_CLOSE.to_string()),
        _ => Self::Opened,
      },
    })
  }
}

/// Where a click sends the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
  DeepLink(String),
  Root,
  Nothing,
}

pub fn click_target(action: Option<&str>, deep_link: &str) -> ClickTarget {
  match action {
    Some(ACTION_EXPLORE) => ClickTarget::DeepLink(deep_link.to_string()),
    Some(ACTION_CLOSE) => ClickTarget::Nothing,
    _ => ClickTarget::Root,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn descriptor(data: Option<&str>) -> NotificationDescriptor {
    NotificationDescriptor::from_push(data, &NotificationConfig::default(), "t1".to_string())
  }

  #[test]
  fn test_missing_payload_uses_default_body() {
    let config = NotificationConfig::default();
    assert_eq!(descriptor(None).body, config.default_body);
    assert_eq!(descriptor(Some("   ")).body, config.default_body);
  }

  #[test]
  fn test_text_payload_becomes_body() {
    let d = descriptor(Some("Maya thanked you for your kindness"));
    assert_eq!(d.body, "Maya thanked you for your kindness");
    assert_eq!(d.title, "EchoDeed");
  }

  #[test]
  fn test_json_payload_fields() {
    let d = descriptor(Some(r#"{"title":"New badge","body":"You earned 5 tokens","url":"/rewards"}"#));
    assert_eq!(d.title, "New badge");
    assert_eq!(d.body, "You earned 5 tokens");
    assert_eq!(d.url.as_deref(), Some("/rewards"));
  }

  #[test]
  fn test_malformed_json_uses_defaults() {
    let config = NotificationConfig::default();
    let d = descriptor(Some(r#"{"title": "#));
    assert_eq!(d.body, config.default_body);
    assert_eq!(d.title, config.title);
    assert_eq!(d.url, None);
  }

  #[test]
  fn test_json_scalar_is_text() {
    let d = descriptor(Some("42"));
    assert_eq!(d.body, "42");
  }

  #[test]
  fn test_two_fixed_actions() {
    let actions: Vec<_> = descriptor(None).actions.into_iter().map(|a| a.action).collect();
    assert_eq!(actions, vec!["explore", "close"]);
  }

  #[test]
  fn test_state_transitions() {
    let displayed = NotificationState::Displayed;
    assert_eq!(
      displayed.apply(&Interaction::Dismiss).unwrap(),
      NotificationState::Dismissed
    );
    assert_eq!(
      displayed
        .apply(&Interaction::Click {
          action: Some("explore".to_string())
        })
        .unwrap(),
      NotificationState::ActionInvoked("explore".to_string())
    );
    assert_eq!(
      displayed.apply(&Interaction::Click { action: None }).unwrap(),
      NotificationState::Opened
    );
  }

  #[test]
  fn test_terminal_states_reject_interaction() {
    let closed = NotificationState::ActionInvoked("close".to_string());
    assert!(closed.apply(&Interaction::Dismiss).is_err());
    assert!(NotificationState::Dismissed
      .apply(&Interaction::Click { action: None })
      .is_err());
  }

  #[test]
  fn test_click_targets() {
    assert_eq!(
      click_target(Some("explore"), "/?tab=feed"),
      ClickTarget::DeepLink("/?tab=feed".to_string())
    );
    assert_eq!(click_target(Some("close"), "/?tab=feed"), ClickTarget::Nothing);
    assert_eq!(click_target(None, "/?tab=feed"), ClickTarget::Root);
    assert_eq!(click_target(Some("snooze"), "/?tab=feed"), ClickTarget::Root);
  }
}
