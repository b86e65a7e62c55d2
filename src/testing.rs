//! Test doubles: a scripted network and a host that records effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tokio::sync::Notify;
use url::Url;

use crate::host::Host;
use crate::origin::{path_and_query, Network, Request, Response};
use crate::push::NotificationDescriptor;

pub const ORIGIN: &str = "http://localhost:5000";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// A request seen by the fake network.
#[derive(Debug, Clone)]
pub struct Recorded {
  pub method: Method,
  pub path: String,
  pub body: Option<Vec<u8>>,
}

/// Network that answers from a table keyed by method and path.
///
/// Unknown paths get a 404. Going offline makes every fetch reject. While a
/// gate is held, fetches wait for it to be notified before answering.
#[derive(Default)]
pub struct FakeNetwork {
  gate: Mutex<Option<Arc<Notify>>>,
  routes: Mutex<HashMap<(String, String), Response>>,
  scripts: Mutex<HashMap<(String, String), VecDeque<Option<Response>>>>,
  failing: Mutex<HashSet<String>>,
  offline: AtomicBool,
  requests: Mutex<Vec<Recorded>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, method: Method, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method.to_string(), path.to_string()), response);
  }

  pub fn get(&self, path: &str, response: Response) {
    self.route(Method::GET, path, response);
  }

  /// Answer the next fetches of `path` in order; `None` rejects. Falls back
  /// to the route table once the script runs out.
  pub fn script(&self, method: Method, path: &str, answers: Vec<Option<Response>>) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert((method.to_string(), path.to_string()), answers.into());
  }

  /// Make fetches of `path` reject while the rest of the network works.
  pub fn fail(&self, path: &str) {
    self.failing.lock().unwrap().insert(path.to_string());
  }

  pub fn hold(&self, gate: Arc<Notify>) {
    *self.gate.lock().unwrap() = Some(gate);
  }

  pub fn release(&self) {
    *self.gate.lock().unwrap() = None;
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<Recorded> {
    self.requests.lock().unwrap().clone()
  }

  fn respond(&self, request: &Request) -> Result<Response> {
    let path = path_and_query(&request.url);
    self.requests.lock().unwrap().push(Recorded {
      method: request.method.clone(),
      path: path.clone(),
      body: request.body.clone(),
    });

    let scripted = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&(request.method.to_string(), path.clone()))
      .and_then(|answers| answers.pop_front());
    if let Some(answer) = scripted {
      return answer.ok_or_else(|| eyre!("network unreachable: {}", path));
    }

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&path) {
      return Err(eyre!("network unreachable: {}", path));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&(request.method.to_string(), path))
        .cloned()
        .unwrap_or_else(|| Response::text(404, "not found")),
    )
  }
}

impl Network for FakeNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let gate = self.gate.lock().unwrap().clone();
    let result = self.respond(request);
    async move {
      if let Some(gate) = gate {
        gate.notified().await;
      }
      result
    }
  }
}

/// Host that records every effect it is asked to apply.
#[derive(Default)]
pub struct RecordingHost {
  applied: Mutex<Vec<String>>,
}

impl RecordingHost {
  pub fn applied(&self) -> Vec<String> {
    self.applied.lock().unwrap().clone()
  }

  fn record(&self, entry: String) -> impl Future<Output = Result<()>> + Send {
    self.applied.lock().unwrap().push(entry);
    async { Ok(()) }
  }
}

impl Host for RecordingHost {
  fn skip_waiting(&self) -> impl Future<Output = Result<()>> + Send {
    self.record("skip_waiting".to_string())
  }

  fn claim_clients(&self) -> impl Future<Output = Result<()>> + Send {
    self.record("claim_clients".to_string())
  }

  fn show_notification(
    &self,
    notification: &NotificationDescriptor,
  ) -> impl Future<Output = Result<()>> + Send {
    self.record(format!("show {}: {}", notification.tag, notification.body))
  }

  fn close_notification(&self, tag: &str) -> impl Future<Output = Result<()>> + Send {
    self.record(format!("close {}", tag))
  }

  fn open_window(&self, url: &str) -> impl Future<Output = Result<()>> + Send {
    self.record(format!("open {}", url))
  }
}
