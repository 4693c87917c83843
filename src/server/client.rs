use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use std::time::Duration;
use url::Url;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::reference::{Match, Team};

use super::api_types::{ProbeResponse, RenderFormRequest, RenderFormResponse, SaveResponse};

/// Operations the sync layer needs from the scouting server.
#[async_trait]
pub trait ScoutingServer: Send + Sync {
  /// Uncached GET of the liveness endpoint, aborted after `timeout`.
  async fn health(&self, timeout: Duration) -> Result<ProbeResponse, TransportError>;

  async fn teams(&self) -> Result<Vec<Team>, TransportError>;

  async fn matches(&self) -> Result<Vec<Match>, TransportError>;

  async fn scoring_config(&self) -> Result<serde_json::Value, TransportError>;

  /// Render the form fragment for a team/match pair.
  async fn render_form(&self, team: &str, match_id: &str) -> Result<String, TransportError>;

  /// Save one submission. `Ok` only when the server acknowledged it.
  async fn save_submission(&self, payload: &serde_json::Value) -> Result<(), TransportError>;
}

/// HTTP implementation of [`ScoutingServer`].
#[derive(Clone)]
pub struct HttpServer {
  client: reqwest::Client,
  base: Url,
  config: ServerConfig,
}

impl HttpServer {
  pub fn new(config: &ServerConfig, request_timeout: Duration) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      config: config.clone(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base
      .join(path)
      .map_err(|e| TransportError::Network(format!("invalid endpoint {}: {}", path, e)))
  }

  async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
    let response = self.client.get(self.endpoint(path)?).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(TransportError::Status(status.as_u16()));
    }
    Ok(response.json().await?)
  }
}

#[async_trait]
impl ScoutingServer for HttpServer {
  async fn health(&self, timeout: Duration) -> Result<ProbeResponse, TransportError> {
    let request = self
      .client
      .get(self.endpoint(&self.config.health_path)?)
      .header(CACHE_CONTROL, "no-cache, no-store")
      .header(PRAGMA, "no-cache")
      .timeout(timeout)
      .send();

    // The outer timeout also covers reading the body.
    let response = tokio::time::timeout(timeout, async {
      let response = request.await?;
      let status = response.status().as_u16();
      let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
      let body = response.bytes().await?.to_vec();
      Ok::<_, reqwest::Error>(ProbeResponse {
        status,
        content_type,
        body,
      })
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    Ok(response)
  }

  async fn teams(&self) -> Result<Vec<Team>, TransportError> {
    self.get_json(&self.config.teams_path).await
  }

  async fn matches(&self) -> Result<Vec<Match>, TransportError> {
    self.get_json(&self.config.matches_path).await
  }

  async fn scoring_config(&self) -> Result<serde_json::Value, TransportError> {
    self.get_json(&self.config.scoring_config_path).await
  }

  async fn render_form(&self, team: &str, match_id: &str) -> Result<String, TransportError> {
    let response = self
      .client
      .post(self.endpoint(&self.config.form_path)?)
      .json(&RenderFormRequest { team, match_id })
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(TransportError::Status(status.as_u16()));
    }

    let body: RenderFormResponse = response.json().await?;
    if !body.success {
      return Err(TransportError::Rejected);
    }
    Ok(body.html)
  }

  async fn save_submission(&self, payload: &serde_json::Value) -> Result<(), TransportError> {
    let response = self
      .client
      .post(self.endpoint(&self.config.save_path)?)
      .json(payload)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(TransportError::Status(status.as_u16()));
    }

    let body: SaveResponse = response.json().await?;
    if !body.success {
      return Err(TransportError::Rejected);
    }
    Ok(())
  }
}
