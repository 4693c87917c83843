mod renderfns;
mod views;

use crate::app::App;
use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1), // Header
      Constraint::Length(5), // Status
      Constraint::Min(1),    // Pending list
      Constraint::Length(1), // Notice bar
    ])
    .split(frame.area());

  renderfns::draw_header(frame, chunks[0], app.server_url(), app.banner());
  views::status::draw_status(frame, chunks[1], app);
  views::pending::draw_pending_list(frame, chunks[2], &app.snapshot().pending, app.selected());
  draw_notice_bar(frame, chunks[3], app);
}

fn draw_notice_bar(frame: &mut Frame, area: Rect, app: &App) {
  let (content, style) = match app.notice() {
    Some(notice) => (format!(" {}", notice), Style::default().fg(Color::Yellow)),
    None => (
      " s:sync  r:refresh  p:probe  j/k:nav  q:quit".to_string(),
      Style::default().fg(Color::DarkGray),
    ),
  };

  let paragraph = Paragraph::new(content).style(style);
  frame.render_widget(paragraph, area);
}
