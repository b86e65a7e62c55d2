//! Request classification.
//!
//! An ordered table of (route, strategy) pairs; the first route that matches
//! decides. The last route always matches, so every request gets exactly one
//! strategy.

use reqwest::Method;
use serde::Serialize;

use crate::config::{Config, StaticStrategy};
use crate::origin::Request;

/// URL schemes used by browser extensions.
pub const EXTENSION_SCHEMES: &[&str] = &[
  "chrome-extension",
  "moz-extension",
  "safari-web-extension",
  "ms-browser-extension",
];

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Not intercepted; goes straight to the network
  Passthrough,
  /// Not intercepted; left to the browser
  Ignore,
  Api,
  Navigation,
  CacheFirst,
  NetworkFirst,
}

impl From<StaticStrategy> for Strategy {
  fn from(strategy: StaticStrategy) -> Self {
    match strategy {
      StaticStrategy::CacheFirst => Strategy::CacheFirst,
      StaticStrategy::NetworkFirst => Strategy::NetworkFirst,
    }
  }
}

/// Predicate half of a route table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  NonGet,
  ExtensionOrigin,
  ApiPrefix(Vec<String>),
  Navigation,
  Any,
}

impl Route {
  pub fn matches(&self, request: &Request) -> bool {
    match self {
      Route::NonGet => request.method != Method::GET,
      Route::ExtensionOrigin => EXTENSION_SCHEMES.contains(&request.url.scheme()),
      Route::ApiPrefix(prefixes) => {
        let path = request.url.path();
        prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
      }
      Route::Navigation => request.is_navigation(),
      Route::Any => true,
    }
  }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
  routes: Vec<(Route, Strategy)>,
}

impl RouteTable {
  pub fn new(api_prefixes: Vec<String>, static_strategy: StaticStrategy) -> Self {
    Self {
      routes: vec![
        (Route::NonGet, Strategy::Passthrough),
        (Route::ExtensionOrigin, Strategy::Ignore),
        (Route::ApiPrefix(api_prefixes), Strategy::Api),
        (Route::Navigation, Strategy::Navigation),
        (Route::Any, static_strategy.into()),
      ],
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(config.api_prefixes.clone(), config.cache.static_strategy)
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self
      .routes
      .iter()
      .find(|(route, _)| route.matches(request))
      .map(|(_, strategy)| *strategy)
      .unwrap_or(Strategy::Passthrough)
  }
}
