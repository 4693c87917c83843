use chrono::{DateTime, Utc};
use ratatui::prelude::Color;

use crate::reachability::ConnectivityState;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Get the display color for a connectivity state
pub fn connectivity_color(state: ConnectivityState) -> Color {
  match state {
    ConnectivityState::Reachable => Color::Green,
    ConnectivityState::Unreachable => Color::Red,
    ConnectivityState::Unknown => Color::Yellow,
  }
}

/// Human age like "5m ago" or "2d ago"
pub fn age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - then).num_seconds().max(0);
  match secs {
    s if s < 60 => format!("{}s ago", s),
    s if s < 3600 => format!("{}m ago", s / 60),
    s if s < 86_400 => format!("{}h ago", s / 3600),
    s => format!("{}d ago", s / 86_400),
  }
}
