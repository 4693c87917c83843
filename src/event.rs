use crossterm::event::{self, Event as CrosstermEvent, KeyEvent};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::assets::WorkerMessage;
use crate::reachability::ConnectivityState;
use crate::sync::SyncEvent;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Terminal key press
  Key(KeyEvent),
  /// Terminal regained focus
  FocusGained,
  /// Periodic tick for refreshing queue counts
  Tick,
  /// Debounced connectivity change for the banner
  Connectivity(ConnectivityState),
  Sync(SyncEvent),
  Worker(WorkerMessage),
}

/// Event handler that produces events from terminal input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Terminal reads block, so they get their own thread.
    let input_tx = tx.clone();
    tokio::task::spawn_blocking(move || loop {
      if event::poll(tick_rate).unwrap_or(false) {
        let forwarded = match event::read() {
          Ok(CrosstermEvent::Key(key)) => Some(Event::Key(key)),
          Ok(CrosstermEvent::FocusGained) => Some(Event::FocusGained),
          _ => None,
        };
        if let Some(evt) = forwarded {
          if input_tx.send(evt).is_err() {
            break;
          }
        }
      } else if input_tx.send(Event::Tick).is_err() {
        break;
      }
    });

    Self { tx, rx }
  }

  /// Forward debounced banner states into the event stream
  pub fn forward_banner(&self, mut banner: mpsc::UnboundedReceiver<ConnectivityState>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while let Some(state) = banner.recv().await {
        if tx.send(Event::Connectivity(state)).is_err() {
          break;
        }
      }
    });
  }

  /// Forward a broadcast stream, skipping anything the UI fell behind on
  pub fn forward<T, F>(&self, mut rx: broadcast::Receiver<T>, wrap: F)
  where
    T: Clone + Send + 'static,
    F: Fn(T) -> Event + Send + 'static,
  {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(item) => {
            if tx.send(wrap(item)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
