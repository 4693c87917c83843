//! Scripted in-process server used by tests.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::TransportError;
use crate::reference::{Match, Team};

use super::api_types::ProbeResponse;
use super::ScoutingServer;

pub struct FakeServer {
  health: Mutex<Option<ProbeResponse>>,
  health_delay: Mutex<Duration>,
  health_calls: AtomicUsize,
  teams: Mutex<Vec<Team>>,
  matches: Mutex<Vec<Match>>,
  reference_failing: AtomicBool,
  rejected: Mutex<Vec<serde_json::Value>>,
  saved: Mutex<Vec<serde_json::Value>>,
  save_calls: AtomicUsize,
  save_delay: Mutex<Duration>,
}

impl FakeServer {
  /// A server whose liveness endpoint answers with valid JSON.
  pub fn healthy() -> Self {
    Self {
      health: Mutex::new(Some(json_health())),
      health_delay: Mutex::new(Duration::ZERO),
      health_calls: AtomicUsize::new(0),
      teams: Mutex::new(sample_teams()),
      matches: Mutex::new(sample_matches()),
      reference_failing: AtomicBool::new(false),
      rejected: Mutex::new(Vec::new()),
      saved: Mutex::new(Vec::new()),
      save_calls: AtomicUsize::new(0),
      save_delay: Mutex::new(Duration::ZERO),
    }
  }

  /// `None` makes every probe fail at the network level.
  pub fn set_health(&self, response: Option<ProbeResponse>) {
    *self.health.lock().unwrap() = response;
  }

  pub fn set_health_delay(&self, delay: Duration) {
    *self.health_delay.lock().unwrap() = delay;
  }

  pub fn health_calls(&self) -> usize {
    self.health_calls.load(Ordering::SeqCst)
  }

  pub fn set_teams(&self, teams: Vec<Team>) {
    *self.teams.lock().unwrap() = teams;
  }

  pub fn set_reference_failing(&self, failing: bool) {
    self.reference_failing.store(failing, Ordering::SeqCst);
  }

  pub fn reject(&self, payload: serde_json::Value) {
    self.rejected.lock().unwrap().push(payload);
  }

  pub fn clear_rejections(&self) {
    self.rejected.lock().unwrap().clear();
  }

  pub fn set_save_delay(&self, delay: Duration) {
    *self.save_delay.lock().unwrap() = delay;
  }

  pub fn saved(&self) -> Vec<serde_json::Value> {
    self.saved.lock().unwrap().clone()
  }

  pub fn save_calls(&self) -> usize {
    self.save_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ScoutingServer for FakeServer {
  async fn health(&self, timeout: Duration) -> Result<ProbeResponse, TransportError> {
    self.health_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *self.health_delay.lock().unwrap();
    let reply = self.health.lock().unwrap().clone();

    tokio::time::timeout(timeout, tokio::time::sleep(delay))
      .await
      .map_err(|_| TransportError::Timeout)?;

    reply.ok_or_else(|| TransportError::Network("connection refused".to_string()))
  }

  async fn teams(&self) -> Result<Vec<Team>, TransportError> {
    Ok(self.teams.lock().unwrap().clone())
  }

  async fn matches(&self) -> Result<Vec<Match>, TransportError> {
    if self.reference_failing.load(Ordering::SeqCst) {
      return Err(TransportError::Status(502));
    }
    Ok(self.matches.lock().unwrap().clone())
  }

  async fn scoring_config(&self) -> Result<serde_json::Value, TransportError> {
    Ok(serde_json::json!({ "autoPoints": { "leave": 2 } }))
  }

  async fn render_form(&self, team: &str, match_id: &str) -> Result<String, TransportError> {
    Ok(format!(
      "<form data-team=\"{}\" data-match=\"{}\"></form>",
      team, match_id
    ))
  }

  async fn save_submission(&self, payload: &serde_json::Value) -> Result<(), TransportError> {
    self.save_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *self.save_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    if self.rejected.lock().unwrap().contains(payload) {
      return Err(TransportError::Rejected);
    }
    self.saved.lock().unwrap().push(payload.clone());
    Ok(())
  }
}

pub fn json_health() -> ProbeResponse {
  ProbeResponse {
    status: 200,
    content_type: Some("application/json".to_string()),
    body: br#"{"status":"ok"}"#.to_vec(),
  }
}

pub fn sample_teams() -> Vec<Team> {
  ["254", "1678", "971", "118", "2056", "4414", "6328"]
    .iter()
    .enumerate()
    .map(|(i, number)| Team {
      id: (i + 1).to_string(),
      number: number.to_string(),
      name: format!("Team {}", number),
      display_text: format!("{} - Team {}", number, number),
    })
    .collect()
}

pub fn sample_matches() -> Vec<Match> {
  let roster = |numbers: &[&str]| numbers.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();
  vec![
    Match {
      id: "qm1".to_string(),
      match_type: "qualification".to_string(),
      number: 1,
      red_alliance_team_numbers: roster(&["254", "1678", "971"]),
      blue_alliance_team_numbers: roster(&["118", "2056", "4414"]),
      display_text: "Qualification 1".to_string(),
    },
    Match {
      id: "qm2".to_string(),
      match_type: "qualification".to_string(),
      number: 2,
      red_alliance_team_numbers: roster(&["6328", "254", "118"]),
      blue_alliance_team_numbers: roster(&["971", "1678", "2056"]),
      display_text: "Qualification 2".to_string(),
    },
  ]
}
