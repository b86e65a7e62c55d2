//! Host events read from stdin, one JSON object per line.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::origin::{Request, RequestMode};
use crate::worker::Event;

/// Wire form of an event line, e.g. `{"type": "fetch", "url": "/api/dashboard"}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    navigate: bool,
    #[serde(default)]
    accept: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    mode: Option<RequestMode>,
  },
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    tag: String,
    #[serde(default)]
    action: Option<String>,
  },
  NotificationClose {
    tag: String,
  },
}

impl InboundEvent {
  /// `sync_tag` is used when a sync line names no tag.
  pub fn into_event(self, origin: &Url, sync_tag: &str) -> Result<Event> {
    Ok(match self {
      InboundEvent::Install => Event::Install,
      InboundEvent::Activate => Event::Activate,
      InboundEvent::Fetch {
        url,
        method,
        navigate,
        accept,
        body,
        mode,
      } => {
        let request = build_request(
          origin,
          &url,
          method.as_deref(),
          navigate,
          accept.as_deref(),
          body,
        )?;
        Event::Fetch(match mode {
          Some(mode) => request.with_mode(mode),
          None => request,
        })
      }
      InboundEvent::Sync { tag } => Event::Sync {
        tag: tag.unwrap_or_else(|| sync_tag.to_string()),
      },
      InboundEvent::Push { data } => Event::Push { data },
      InboundEvent::NotificationClick { tag, action } => Event::NotificationClick { tag, action },
      InboundEvent::NotificationClose { tag } => Event::NotificationClose { tag },
    })
  }
}

/// Build a request from command line or event line fields.
///
/// `url` may be absolute or a path relative to the origin.
pub fn build_request(
  origin: &Url,
  url: &str,
  method: Option<&str>,
  navigate: bool,
  accept: Option<&str>,
  body: Option<String>,
) -> Result<Request> {
  let url = origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };

  if let Some(method) = method {
    request.method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
  }
  if let Some(accept) = accept {
    request.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("accept"));
    request = request.with_header("accept", accept);
  }
  if let Some(body) = body {
    request = request
      .with_header("content-type", "application/json")
      .with_body(body);
  }

  Ok(request)
}

/// One line of input.
#[derive(Debug)]
pub enum Incoming {
  Event(Event),
  Malformed { line: String, error: String },
}

pub fn parse_line(line: &str, origin: &Url, sync_tag: &str) -> Incoming {
  let parsed = serde_json::from_str::<InboundEvent>(line)
    .map_err(|e| eyre!("Invalid event: {}", e))
    .and_then(|inbound| inbound.into_event(origin, sync_tag));

  match parsed {
    Ok(event) => Incoming::Event(event),
    Err(e) => Incoming::Malformed {
      line: line.to_string(),
      error: e.to_string(),
    },
  }
}

/// Reads stdin on a background task and hands parsed lines over a channel.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Incoming>,
}

impl EventHandler {
  pub fn new(origin: Url, sync_tag: String) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
          continue;
        }
        if tx.send(parse_line(&line, &origin, &sync_tag)).is_err() {
          break;
        }
      }
      debug!("stdin closed");
    });

    Self { rx }
  }

  /// Next line, or `None` once stdin is closed.
  pub async fn next(&mut self) -> Option<Incoming> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ORIGIN;

  fn parse(line: &str) -> Incoming {
    parse_line(line, &Url::parse(ORIGIN).unwrap(), "kindness-sync")
  }

  #[test]
  fn test_fetch_line_resolves_against_origin() {
    let Incoming::Event(Event::Fetch(request)) = parse(r#"{"type":"fetch","url":"/api/dashboard"}"#)
    else {
      panic!("expected fetch");
    };
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.url.as_str(), "http://localhost:5000/api/dashboard");
    assert!(!request.is_navigation());
  }

  #[test]
  fn test_navigation_line() {
    let Incoming::Event(Event::Fetch(request)) =
      parse(r#"{"type":"fetch","url":"/feed","navigate":true}"#)
    else {
      panic!("expected fetch");
    };
    assert!(request.is_navigation());
    assert!(request.accepts_html());
  }

  #[test]
  fn test_post_line_carries_body() {
    let Incoming::Event(Event::Fetch(request)) = parse(
      r#"{"type":"fetch","url":"/api/kindness-posts","method":"post","body":"{\"a\":1}"}"#,
    ) else {
      panic!("expected fetch");
    };
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
  }

  #[test]
  fn test_sync_defaults_to_configured_tag() {
    assert!(matches!(
      parse(r#"{"type":"sync"}"#),
      Incoming::Event(Event::Sync { ref tag }) if tag == "kindness-sync"
    ));
    assert!(matches!(
      parse(r#"{"type":"sync","tag":"other"}"#),
      Incoming::Event(Event::Sync { ref tag }) if tag == "other"
    ));
  }

  #[test]
  fn test_click_line() {
    assert!(matches!(
      parse(r#"{"type":"notification_click","tag":"t1","action":"explore"}"#),
      Incoming::Event(Event::NotificationClick { ref tag, action: Some(ref a) }) if tag == "t1" && a == "explore"
    ));
  }

  #[test]
  fn test_malformed_lines() {
    assert!(matches!(parse("not json"), Incoming::Malformed { .. }));
    assert!(matches!(
      parse(r#"{"type":"teleport"}"#),
      Incoming::Malformed { .. }
    ));
    assert!(matches!(
      parse(r#"{"type":"fetch","url":"/x","method":"NOT A METHOD"}"#),
      Incoming::Malformed { .. }
    ));
  }

  #[test]
  fn test_explicit_mode() {
    let Incoming::Event(Event::Fetch(request)) =
      parse(r#"{"type":"fetch","url":"/feed","mode":"navigate"}"#)
    else {
      panic!("expected fetch");
    };
    assert!(request.is_navigation());
    assert!(!request.accepts_html());
  }

  #[test]
  fn test_accept_override() {
    let request = build_request(
      &Url::parse(ORIGIN).unwrap(),
      "/about",
      None,
      true,
      Some("application/json"),
      None,
    )
    .unwrap();
    assert_eq!(request.header("accept"), Some("application/json"));
    assert!(request.is_navigation());
  }
}
