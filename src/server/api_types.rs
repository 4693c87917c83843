//! Wire types exchanged with the scouting server.

use serde::{Deserialize, Serialize};

/// Raw liveness probe response, validated by the reachability monitor.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

/// Expected shape of a `/health` body.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthBody {
  pub status: serde_json::Value,
}

/// Request body for the form render endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RenderFormRequest<'a> {
  pub team: &'a str,
  #[serde(rename = "match")]
  pub match_id: &'a str,
}

/// Response from the form render endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderFormResponse {
  pub success: bool,
  #[serde(default)]
  pub html: String,
}

/// Response from the save endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveResponse {
  pub success: bool,
}
