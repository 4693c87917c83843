use crate::assets::{WorkerMessage, WorkerState};
use crate::context::SessionContext;
use crate::event::{Event, EventHandler};
use crate::queue::{QueueEntry, QueueStats};
use crate::reachability::{spawn_banner, ConnectivityState, NetworkSignal, ProbeTrigger};
use crate::sync::{SyncEvent, SyncPhase, SyncRequest};
use crate::ui;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use crossterm::event::{DisableFocusChange, EnableFocusChange, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::io::stdout;
use std::time::Duration;
use tracing::warn;

/// Everything the dashboard renders, refreshed on each tick
#[derive(Debug, Default)]
pub struct Snapshot {
  pub stats: QueueStats,
  pub pending: Vec<QueueEntry>,
  pub reference_fetched_at: Option<DateTime<Utc>>,
  pub reference_stale: bool,
  pub teams: usize,
  pub matches: usize,
}

/// Dashboard state
pub struct App {
  ctx: SessionContext,

  /// Debounced connectivity shown in the banner
  banner: ConnectivityState,

  phase: SyncPhase,

  worker_state: WorkerState,

  /// Last notice from the sync layer
  notice: Option<String>,

  snapshot: Snapshot,

  /// Selected row in the pending list
  selected: usize,

  should_quit: bool,
}

impl App {
  pub fn new(ctx: SessionContext) -> Self {
    let worker_state = ctx.assets.state();
    Self {
      ctx,
      banner: ConnectivityState::Unknown,
      phase: SyncPhase::Idle,
      worker_state,
      notice: None,
      snapshot: Snapshot::default(),
      selected: 0,
      should_quit: false,
    }
  }

  pub async fn run(mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    stdout().execute(EnableFocusChange)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut events = EventHandler::new(Duration::from_millis(250));
    events.forward_banner(spawn_banner(
      self.ctx.monitor.subscribe(),
      self.ctx.config.tunables.banner_settle(),
    ));
    events.forward(self.ctx.sync.subscribe(), Event::Sync);
    events.forward(self.ctx.assets.subscribe(), Event::Worker);

    // Take over an app shell installed by an earlier session.
    match self.ctx.assets.resume() {
      Ok(true) => {
        if let Err(e) = self.ctx.assets.activate().await {
          warn!(error = %e, "Failed to activate app shell");
        }
      }
      Ok(false) => {}
      Err(e) => warn!(error = %e, "Failed to read app shell cache"),
    }

    self.ctx.spawn_background();
    self.reload();

    let result = self.event_loop(&mut terminal, &mut events).await;

    // Cleanup terminal
    disable_raw_mode()?;
    stdout().execute(DisableFocusChange)?;
    stdout().execute(LeaveAlternateScreen)?;

    drop(events);
    self.ctx.shutdown().await;
    result
  }

  async fn event_loop<B: Backend>(
    &mut self,
    terminal: &mut Terminal<B>,
    events: &mut EventHandler,
  ) -> Result<()> {
    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, self))?;

      if let Some(event) = events.next().await {
        self.handle_event(event);
      }
    }
    Ok(())
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::FocusGained => self.ctx.monitor.trigger(ProbeTrigger::VisibilityRegained),
      Event::Tick => self.reload(),
      Event::Connectivity(state) => self.banner = state,
      Event::Sync(event) => self.handle_sync_event(event),
      Event::Worker(message) => self.handle_worker_message(message),
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    match key.code {
      KeyCode::Char('q') => self.should_quit = true,
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
        self.should_quit = true;
      }

      KeyCode::Char('s') => {
        self.notice = Some("sync requested".to_string());
        self.ctx.sync.request(SyncRequest::SyncNow);
      }
      KeyCode::Char('r') => {
        self.notice = Some("refreshing reference data".to_string());
        self.ctx.sync.request(SyncRequest::RefreshReference);
      }
      KeyCode::Char('p') => self.ctx.monitor.trigger(ProbeTrigger::Manual),

      // Navigation
      KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
      KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),

      _ => {}
    }
  }

  fn handle_sync_event(&mut self, event: SyncEvent) {
    match event {
      SyncEvent::Flushed(summary) => self.notice = Some(summary.message()),
      SyncEvent::Saved { id, synced } => {
        self.notice = Some(if synced {
          format!("submission {} synced", id)
        } else {
          format!("submission {} saved locally, will sync later", id)
        });
      }
      SyncEvent::ReferenceRefreshed(outcome) => {
        self.notice = Some(format!("reference refresh: {:?}", outcome));
      }
    }
    self.reload();
  }

  fn handle_worker_message(&mut self, message: WorkerMessage) {
    match message {
      WorkerMessage::StateChanged(state) => self.worker_state = state,
      WorkerMessage::Claimed { generation } => {
        self.notice = Some(format!("app shell {} active", generation));
      }
      WorkerMessage::NetworkLost => {
        self.notice = Some("network lost".to_string());
        self.ctx.monitor.on_network_signal(NetworkSignal::Offline);
      }
      WorkerMessage::NetworkRestored => {
        self.notice = Some("network restored".to_string());
        self.ctx.monitor.on_network_signal(NetworkSignal::Online);
      }
      WorkerMessage::Generation(_) => {}
    }
  }

  /// Re-read queue and reference state from the local stores
  fn reload(&mut self) {
    self.phase = *self.ctx.sync.phase().borrow();

    match self.ctx.queue.stats() {
      Ok(stats) => self.snapshot.stats = stats,
      Err(e) => warn!(error = %e, "Failed to read queue stats"),
    }
    match self.ctx.queue.list_pending() {
      Ok(pending) => self.snapshot.pending = pending,
      Err(e) => warn!(error = %e, "Failed to list pending submissions"),
    }

    let reference = self.ctx.reference.get();
    self.snapshot.teams = reference.as_ref().map_or(0, |r| r.teams.len());
    self.snapshot.matches = reference.as_ref().map_or(0, |r| r.matches.len());
    self.snapshot.reference_fetched_at = self.ctx.reference.fetched_at();
    self.snapshot.reference_stale = self.ctx.reference.is_stale();

    self.selected = self
      .selected
      .min(self.snapshot.pending.len().saturating_sub(1));
  }

  fn move_selection(&mut self, delta: i32) {
    let len = self.snapshot.pending.len();
    if len == 0 {
      return;
    }
    let next = (self.selected as i32 + delta).clamp(0, len as i32 - 1);
    self.selected = next as usize;
  }

  // Accessors for UI rendering
  pub fn server_url(&self) -> &str {
    &self.ctx.config.server.url
  }

  pub fn banner(&self) -> ConnectivityState {
    self.banner
  }

  pub fn phase(&self) -> SyncPhase {
    self.phase
  }

  pub fn worker_state(&self) -> WorkerState {
    self.worker_state
  }

  pub fn generation(&self) -> &str {
    self.ctx.assets.generation()
  }

  pub fn notice(&self) -> Option<&str> {
    self.notice.as_deref()
  }

  pub fn snapshot(&self) -> &Snapshot {
    &self.snapshot
  }

  pub fn selected(&self) -> usize {
    self.selected
  }
}
