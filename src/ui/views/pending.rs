use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};

use crate::queue::QueueEntry;
use crate::ui::renderfns::truncate;

pub fn draw_pending_list(frame: &mut Frame, area: Rect, pending: &[QueueEntry], selected: usize) {
  let block = Block::default()
    .title(format!(" Pending submissions ({}) ", pending.len()))
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::Blue));

  if pending.is_empty() {
    let paragraph = Paragraph::new("Nothing waiting to sync.")
      .block(block)
      .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(paragraph, area);
    return;
  }

  let items: Vec<ListItem> = pending
    .iter()
    .map(|entry| {
      let line = Line::from(vec![
        Span::styled(
          entry.created_at.format("%H:%M:%S ").to_string(),
          Style::default().fg(Color::Cyan),
        ),
        Span::styled(
          format!("{:<10}", describe(&entry.payload)),
          Style::default().fg(Color::Yellow),
        ),
        Span::raw(" "),
        Span::styled(
          truncate(&entry.payload.to_string(), 60),
          Style::default().fg(Color::DarkGray),
        ),
      ]);
      ListItem::new(line)
    })
    .collect();

  let list = List::new(items)
    .block(block)
    .highlight_style(
      Style::default()
        .bg(Color::DarkGray)
        .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("> ");

  let mut state = ListState::default();
  state.select(Some(selected));

  frame.render_stateful_widget(list, area, &mut state);
}

/// Short "team@match" label when the payload carries them
fn describe(payload: &serde_json::Value) -> String {
  let field = |name: &str| match payload.get(name) {
    Some(serde_json::Value::String(s)) => Some(s.clone()),
    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
    _ => None,
  };
  match (field("team"), field("match")) {
    (Some(team), Some(m)) => format!("{}@{}", team, m),
    (Some(team), None) => team,
    _ => "-".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_describe_payload() {
    assert_eq!(describe(&json!({ "team": "254", "match": "qm1" })), "254@qm1");
    assert_eq!(describe(&json!({ "team": 971 })), "971");
    assert_eq!(describe(&json!({ "notes": "x" })), "-");
  }
}
