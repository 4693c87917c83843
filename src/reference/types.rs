use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A team attending the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
  pub id: String,
  pub number: String,
  pub name: String,
  pub display_text: String,
}

/// A scheduled match with both alliance rosters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
  pub id: String,
  #[serde(rename = "type")]
  pub match_type: String,
  pub number: u32,
  #[serde(default)]
  pub red_alliance_team_numbers: BTreeSet<String>,
  #[serde(default)]
  pub blue_alliance_team_numbers: BTreeSet<String>,
  pub display_text: String,
}

impl Match {
  /// Whether `team_number` plays in either alliance.
  pub fn involves(&self, team_number: &str) -> bool {
    self.red_alliance_team_numbers.contains(team_number)
      || self.blue_alliance_team_numbers.contains(team_number)
  }
}

/// Everything needed to render a scouting form without the server.
///
/// Replaced wholesale on every successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSnapshot {
  pub teams: Vec<Team>,
  pub matches: Vec<Match>,
  pub scoring_config: serde_json::Value,
  /// Rendered HTML fragment, kept opaque.
  pub form_template_markup: String,
  pub fetched_at: DateTime<Utc>,
}

impl ReferenceSnapshot {
  pub fn find_match(&self, match_id: &str) -> Option<&Match> {
    self.matches.iter().find(|m| m.id == match_id)
  }

  /// Teams playing in `match_id`, or every team when the match is absent or unknown.
  pub fn teams_for_match(&self, match_id: Option<&str>) -> Vec<&Team> {
    match match_id.and_then(|id| self.find_match(id)) {
      Some(m) => self.teams.iter().filter(|t| m.involves(&t.number)).collect(),
      None => self.teams.iter().collect(),
    }
  }
}

/// Pick a (team number, match id) pair the server can render a form for.
///
/// Prefers the first team on the first match's roster so the pair is valid.
pub fn template_pair(teams: &[Team], matches: &[Match]) -> Option<(String, String)> {
  let first_match = matches.first()?;
  let team = teams
    .iter()
    .find(|t| first_match.involves(&t.number))
    .or_else(|| teams.first())?;
  Some((team.number.clone(), first_match.id.clone()))
}
