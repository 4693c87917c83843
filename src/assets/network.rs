use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::TransportError;

/// A request for an application asset, relative to the app origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
  pub method: String,
  /// Path plus query, e.g. `/scouting?event=2024cmp`.
  pub url: String,
  /// Whether this is a top-level page navigation.
  pub navigate: bool,
}

impl AssetRequest {
  pub fn get(url: &str) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.to_string(),
      navigate: false,
    }
  }

  pub fn navigate(url: &str) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  /// Path component without the query string.
  pub fn path(&self) -> &str {
    self.url.split(['?', '#']).next().unwrap_or(&self.url)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl AssetResponse {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// A plain-text response made up locally when nothing better exists.
  pub fn synthesized(status: u16, message: &str) -> Self {
    Self {
      status,
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: message.as_bytes().to_vec(),
    }
  }
}

/// The network as seen by the asset worker.
#[async_trait]
pub trait AssetNetwork: Send + Sync {
  async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, TransportError>;
}

/// reqwest-backed network for a single app origin.
#[derive(Clone)]
pub struct HttpAssetNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpAssetNetwork {
  pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client, origin })
  }
}

#[async_trait]
impl AssetNetwork for HttpAssetNetwork {
  async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, TransportError> {
    let url = self
      .origin
      .join(&request.url)
      .map_err(|e| TransportError::Network(format!("invalid url {}: {}", request.url, e)))?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| TransportError::Network(e.to_string()))?;

    let response = self.client.request(method, url).send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(AssetResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_path_strips_query_and_fragment() {
    assert_eq!(AssetRequest::get("/scouting?event=x").path(), "/scouting");
    assert_eq!(AssetRequest::get("/a.js#map").path(), "/a.js");
    assert_eq!(AssetRequest::get("/").path(), "/");
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let response = AssetResponse {
      status: 200,
      headers: vec![("Cache-Control".to_string(), "no-store".to_string())],
      body: Vec::new(),
    };
    assert_eq!(response.header("cache-control"), Some("no-store"));
    assert!(response.header("etag").is_none());
  }
}
