use std::future::Future;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::types::{Request, Response};
use super::Network;

/// HTTP client for the EchoDeed origin server.
#[derive(Clone)]
pub struct OriginClient {
  http: reqwest::Client,
}

impl OriginClient {
  pub fn new() -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(concat!("echodeed-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http })
  }
}

impl Network for OriginClient {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    async move {
      let mut builder = self
        .http
        .request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      debug!(url = %request.url, status, bytes = body.len(), "origin responded");

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}
