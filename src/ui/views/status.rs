use chrono::Utc;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph};

use crate::app::App;
use crate::sync::SyncPhase;
use crate::ui::renderfns::age;

pub fn draw_status(frame: &mut Frame, area: Rect, app: &App) {
  let snapshot = app.snapshot();
  let label = Style::default().fg(Color::DarkGray);

  let queue = Line::from(vec![
    Span::styled(" Queue      ", label),
    Span::styled(
      format!("{} pending", snapshot.stats.pending),
      Style::default().fg(if snapshot.stats.pending > 0 {
        Color::Yellow
      } else {
        Color::Green
      }),
    ),
    Span::raw(format!(", {} synced", snapshot.stats.synced)),
    Span::styled(
      match app.phase() {
        SyncPhase::Flushing => "  (syncing...)",
        SyncPhase::Idle => "",
      },
      Style::default().fg(Color::Cyan),
    ),
  ]);

  let reference = match snapshot.reference_fetched_at {
    Some(at) => Line::from(vec![
      Span::styled(" Reference  ", label),
      Span::raw(format!(
        "{} teams, {} matches, fetched {}",
        snapshot.teams,
        snapshot.matches,
        age(at, Utc::now())
      )),
      if snapshot.reference_stale {
        Span::styled("  stale", Style::default().fg(Color::Yellow))
      } else {
        Span::raw("")
      },
    ]),
    None => Line::from(vec![
      Span::styled(" Reference  ", label),
      Span::styled("not cached yet", Style::default().fg(Color::Yellow)),
    ]),
  };

  let shell = Line::from(vec![
    Span::styled(" App shell  ", label),
    Span::raw(format!("{} ({})", app.generation(), app.worker_state().label())),
  ]);

  let block = Block::default()
    .title(" Status ")
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::Blue));

  frame.render_widget(Paragraph::new(vec![queue, reference, shell]).block(block), area);
}
