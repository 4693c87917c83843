use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

use crate::reachability::ConnectivityState;

use super::utils::connectivity_color;

/// Draw the header bar with logo, server, connectivity banner and shortcuts
pub fn draw_header(frame: &mut Frame, area: Rect, server_url: &str, banner: ConnectivityState) {
  let host = extract_host(server_url);

  let header = Line::from(vec![
    Span::styled(" fieldsync ", Style::default().fg(Color::Cyan).bold()),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(format!(" {} ", host), Style::default().fg(Color::White)),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(
      format!(" {} ", banner_text(banner)),
      Style::default().fg(connectivity_color(banner)).bold(),
    ),
    Span::raw("  "),
    // Shortcuts - keys highlighted, descriptions dimmed
    Span::styled("<s>", Style::default().fg(Color::Cyan)),
    Span::styled(" sync", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<r>", Style::default().fg(Color::Cyan)),
    Span::styled(" refresh", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<p>", Style::default().fg(Color::Cyan)),
    Span::styled(" probe", Style::default().fg(Color::DarkGray)),
    Span::raw("   "),
    Span::styled("<q>", Style::default().fg(Color::Cyan)),
    Span::styled(" quit", Style::default().fg(Color::DarkGray)),
  ]);

  let paragraph = Paragraph::new(header).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}

fn banner_text(state: ConnectivityState) -> &'static str {
  match state {
    ConnectivityState::Reachable => "ONLINE",
    ConnectivityState::Unreachable => "OFFLINE - saving locally",
    ConnectivityState::Unknown => "checking...",
  }
}

/// Extract host from the server URL
fn extract_host(url: &str) -> &str {
  url
    .strip_prefix("https://")
    .or_else(|| url.strip_prefix("http://"))
    .unwrap_or(url)
    .split('/')
    .next()
    .unwrap_or(url)
}
