use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Full-page load
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A navigation request, as issued by the browser for a page load.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_mode(RequestMode::Navigate)
      .with_header("accept", "text/html,application/xhtml+xml")
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Path plus query, as used for route matching and logging.
  pub fn path_and_query(&self) -> String {
    path_and_query(&self.url)
  }
}

/// A captured or synthesized response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), content_type.to_string())],
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, "application/json", value.to_string())
  }

  pub fn text(status: u16, text: &str) -> Self {
    Self::new(status, "text/plain; charset=utf-8", text)
  }

  pub fn html(status: u16, html: &str) -> Self {
    Self::new(status, "text/html; charset=utf-8", html)
  }

  /// Only a plain 200 is worth caching; redirects and partial content are not.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Compact view of a response for printing.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSummary {
  pub status: u16,
  pub content_type: Option<String>,
  pub body_len: usize,
  pub body: String,
}

impl From<&Response> for ResponseSummary {
  fn from(response: &Response) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type().map(String::from),
      body_len: response.body.len(),
      body: response.body_text(),
    }
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

pub fn path_and_query(url: &Url) -> String {
  match url.query() {
    Some(query) => format!("{}?{}", url.path(), query),
    None => url.path().to_string(),
  }
}
