//! Sync orchestrator: the single coordinator between reachability, the
//! submission queue and the reference cache.
//!
//! A failed entry is never retried inside a flush. It stays pending until the
//! next trigger (reconnect, manual sync), which gives natural backoff tied to
//! connectivity changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::prefs::{Flag, Preferences};
use crate::queue::{QueueEntry, SubmissionQueue};
use crate::reachability::{ConnectivityState, ProbeTrigger, ReachabilityMonitor};
use crate::reference::{RefreshOutcome, ReferenceCache};
use crate::server::ScoutingServer;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Idle,
  Flushing,
}

/// Result of one flush, reported to the UI as a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Entries skipped because another attempt for them was in flight.
  pub skipped: usize,
  pub pruned: usize,
  pub refresh: Option<RefreshOutcome>,
  pub aborted_offline: bool,
  pub already_running: bool,
  pub errors: Vec<String>,
}

impl FlushSummary {
  pub fn message(&self) -> String {
    if self.already_running {
      return "sync already in progress".to_string();
    }
    if self.aborted_offline {
      return "offline, sync postponed".to_string();
    }
    if self.attempted == 0 {
      return "nothing to sync".to_string();
    }
    if self.failed == 0 {
      format!("synced {} submission(s)", self.succeeded)
    } else {
      format!(
        "synced {} submission(s), {} will retry later",
        self.succeeded, self.failed
      )
    }
  }
}

/// What happened to a submission handed to [`SyncOrchestrator::save`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
  Synced(QueueEntry),
  /// Saved locally, will sync later.
  SavedLocally(QueueEntry),
}

/// Requests from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
  SyncNow,
  RefreshReference,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Flushed(FlushSummary),
  Saved { id: String, synced: bool },
  ReferenceRefreshed(RefreshOutcome),
}

enum EntryOutcome {
  Synced,
  Failed(String),
  Skipped,
}

pub struct SyncOrchestrator<S: KeyValueStore> {
  queue: Arc<SubmissionQueue<S>>,
  reference: Arc<ReferenceCache<S>>,
  monitor: Arc<ReachabilityMonitor>,
  prefs: Preferences<S>,
  server: Arc<dyn ScoutingServer>,
  phase: watch::Sender<SyncPhase>,
  flush_lock: tokio::sync::Mutex<()>,
  events: broadcast::Sender<SyncEvent>,
  request_tx: mpsc::UnboundedSender<SyncRequest>,
  request_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncRequest>>>,
}

impl<S: KeyValueStore + 'static> SyncOrchestrator<S> {
  pub fn new(
    queue: Arc<SubmissionQueue<S>>,
    reference: Arc<ReferenceCache<S>>,
    monitor: Arc<ReachabilityMonitor>,
    prefs: Preferences<S>,
    server: Arc<dyn ScoutingServer>,
  ) -> Self {
    let (phase, _) = watch::channel(SyncPhase::Idle);
    let (events, _) = broadcast::channel(64);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    Self {
      queue,
      reference,
      monitor,
      prefs,
      server,
      phase,
      flush_lock: tokio::sync::Mutex::new(()),
      events,
      request_tx,
      request_rx: Mutex::new(Some(request_rx)),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn phase(&self) -> watch::Receiver<SyncPhase> {
    self.phase.subscribe()
  }

  pub fn request(&self, request: SyncRequest) {
    if self.request_tx.send(request).is_err() {
      debug!(?request, "Sync loop not running, request dropped");
    }
  }

  /// Queue `payload` durably, then try to deliver it right away when reachable.
  ///
  /// Storage failures are returned so the caller can offer another way to
  /// capture the data.
  pub async fn save(&self, payload: serde_json::Value) -> Result<SaveOutcome, StorageError> {
    let entry = self.queue.enqueue(payload)?;
    self.monitor.trigger(ProbeTrigger::SaveAttempt);

    let synced = self.monitor.can_save_to_server()
      && matches!(self.sync_entry(&entry).await, EntryOutcome::Synced);

    if !synced {
      info!(id = %entry.id, "Saved locally, will sync later");
    }
    self.report(SyncEvent::Saved {
      id: entry.id.clone(),
      synced,
    });

    Ok(if synced {
      SaveOutcome::Synced(entry)
    } else {
      SaveOutcome::SavedLocally(entry)
    })
  }

  /// Drain pending submissions, prune, and refresh stale reference data.
  ///
  /// Never fails: every error is folded into the returned summary.
  pub async fn flush(&self) -> FlushSummary {
    let Ok(_running) = self.flush_lock.try_lock() else {
      debug!("Flush requested while another is running");
      return FlushSummary {
        already_running: true,
        ..Default::default()
      };
    };

    let mut summary = FlushSummary::default();

    if !self.monitor.can_save_to_server() {
      debug!("Server unreachable, flush aborted");
      summary.aborted_offline = true;
      self.report(SyncEvent::Flushed(summary.clone()));
      return summary;
    }

    self.phase.send_replace(SyncPhase::Flushing);

    match self.queue.list_pending() {
      Ok(pending) => {
        for entry in pending {
          match self.sync_entry(&entry).await {
            EntryOutcome::Synced => {
              summary.attempted += 1;
              summary.succeeded += 1;
            }
            EntryOutcome::Failed(reason) => {
              summary.attempted += 1;
              summary.failed += 1;
              summary.errors.push(format!("{}: {}", entry.id, reason));
            }
            EntryOutcome::Skipped => summary.skipped += 1,
          }
        }
      }
      Err(e) => summary.errors.push(format!("failed to read queue: {}", e)),
    }

    match self.queue.prune() {
      Ok(pruned) => summary.pruned = pruned,
      Err(e) => summary.errors.push(format!("failed to prune queue: {}", e)),
    }

    if self.reference.is_stale() {
      let outcome = match self.reference.refresh().await {
        Ok(outcome) => outcome,
        Err(e) => {
          summary
            .errors
            .push(format!("failed to store reference data: {}", e));
          RefreshOutcome::Failed(e.to_string())
        }
      };
      summary.refresh = Some(outcome);
    }

    self.phase.send_replace(SyncPhase::Idle);

    info!(
      succeeded = summary.succeeded,
      failed = summary.failed,
      skipped = summary.skipped,
      pruned = summary.pruned,
      "Flush finished"
    );
    self.report(SyncEvent::Flushed(summary.clone()));
    summary
  }

  /// Explicit reference refresh; runs regardless of the background precache flag.
  pub async fn refresh_reference(&self) -> Result<RefreshOutcome, StorageError> {
    let outcome = self.reference.refresh().await?;
    self.report(SyncEvent::ReferenceRefreshed(outcome.clone()));
    Ok(outcome)
  }

  /// One attempt for one entry, guarded against concurrent attempts for the same id.
  async fn sync_entry(&self, entry: &QueueEntry) -> EntryOutcome {
    let Some(_in_flight) = self.queue.begin_sync(&entry.id) else {
      debug!(id = %entry.id, "Sync already in flight, skipping");
      return EntryOutcome::Skipped;
    };

    // Another task may have delivered it since the caller listed it.
    match self.queue.is_pending(&entry.id) {
      Ok(true) => {}
      Ok(false) => return EntryOutcome::Skipped,
      Err(e) => return EntryOutcome::Failed(e.to_string()),
    }

    match self.server.save_submission(&entry.payload).await {
      Ok(()) => match self.queue.mark_synced(&entry.id) {
        Ok(_) => EntryOutcome::Synced,
        Err(e) => {
          warn!(id = %entry.id, error = %e, "Server accepted submission but marking it failed");
          EntryOutcome::Failed(format!("could not record delivery: {}", e))
        }
      },
      Err(e) => {
        warn!(id = %entry.id, error = %e, "Submission sync failed, will retry later");
        EntryOutcome::Failed(e.to_string())
      }
    }
  }

  async fn stale_check(&self) {
    if !self.prefs.get(Flag::BackgroundPrecache) {
      return;
    }
    if !self.monitor.can_save_to_server() || !self.reference.is_stale() {
      return;
    }

    debug!("Reference data stale, refreshing in background");
    if let Err(e) = self.refresh_reference().await {
      warn!(error = %e, "Background reference refresh could not be stored");
    }
  }

  fn report(&self, event: SyncEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }

  /// Coordinate flushes until `shutdown` flips.
  pub async fn run(self: Arc<Self>, stale_check_every: Duration, mut shutdown: watch::Receiver<bool>) {
    let requests = self.request_rx.lock().ok().and_then(|mut rx| rx.take());
    let Some(mut requests) = requests else {
      warn!("Sync loop already running");
      return;
    };

    let mut connectivity = self.monitor.subscribe();
    let mut last = *connectivity.borrow_and_update();
    if last == ConnectivityState::Reachable {
      self.flush().await;
    }

    let mut ticker = tokio::time::interval(stale_check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          let now = *connectivity.borrow_and_update();
          let restored = now == ConnectivityState::Reachable && last != ConnectivityState::Reachable;
          last = now;
          if restored {
            info!("Connectivity restored, flushing queue");
            self.flush().await;
          }
        }
        Some(request) = requests.recv() => match request {
          SyncRequest::SyncNow => {
            self.monitor.refresh().await;
            self.flush().await;
          }
          SyncRequest::RefreshReference => {
            if let Err(e) = self.refresh_reference().await {
              warn!(error = %e, "Reference refresh could not be stored");
            }
          }
        },
        _ = ticker.tick() => self.stale_check().await,
        _ = shutdown.changed() => break,
      }
    }

    debug!("Sync loop stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::fake::{json_health, FakeServer};
  use crate::store::SqliteStore;
  use serde_json::json;

  struct Harness {
    server: Arc<FakeServer>,
    monitor: Arc<ReachabilityMonitor>,
    queue: Arc<SubmissionQueue<SqliteStore>>,
    reference: Arc<ReferenceCache<SqliteStore>>,
    sync: Arc<SyncOrchestrator<SqliteStore>>,
  }

  async fn harness(online: bool) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let server = Arc::new(FakeServer::healthy());
    if !online {
      server.set_health(None);
    }
    let monitor = Arc::new(ReachabilityMonitor::new(
      server.clone(),
      Duration::from_millis(200),
    ));
    monitor.refresh().await;

    let queue = Arc::new(SubmissionQueue::new(Arc::clone(&store)));
    let reference = Arc::new(ReferenceCache::new(
      Arc::clone(&store),
      server.clone(),
      monitor.subscribe(),
    ));
    let sync = Arc::new(SyncOrchestrator::new(
      Arc::clone(&queue),
      Arc::clone(&reference),
      Arc::clone(&monitor),
      Preferences::new(Arc::clone(&store)),
      server.clone(),
    ));

    Harness {
      server,
      monitor,
      queue,
      reference,
      sync,
    }
  }

  fn pending_ids(h: &Harness) -> Vec<String> {
    h.queue
      .list_pending()
      .unwrap()
      .into_iter()
      .map(|e| e.id)
      .collect()
  }

  #[tokio::test]
  async fn test_offline_saves_then_partial_flush() {
    let h = harness(false).await;
    assert_eq!(h.monitor.state(), ConnectivityState::Unreachable);

    let mut saved = Vec::new();
    for i in 1..=3 {
      match h.sync.save(json!({ "entry": i })).await.unwrap() {
        SaveOutcome::SavedLocally(entry) => saved.push(entry),
        other => panic!("expected local save, got {:?}", other),
      }
    }
    assert_eq!(h.server.save_calls(), 0);

    h.server.reject(json!({ "entry": 2 }));
    h.server.set_health(Some(json_health()));
    assert_eq!(h.monitor.refresh().await, ConnectivityState::Reachable);

    let summary = h.sync.flush().await;
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(pending_ids(&h), vec![saved[1].id.clone()]);
    assert_eq!(
      h.server.saved(),
      vec![json!({ "entry": 1 }), json!({ "entry": 3 })]
    );
  }

  #[tokio::test]
  async fn test_flush_offline_makes_no_attempts() {
    let h = harness(false).await;
    h.queue.enqueue(json!(1)).unwrap();

    let summary = h.sync.flush().await;
    assert!(summary.aborted_offline);
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.server.save_calls(), 0);
    assert_eq!(pending_ids(&h).len(), 1);
  }

  #[tokio::test]
  async fn test_failed_entry_waits_for_next_trigger() {
    let h = harness(true).await;
    let entry = h.queue.enqueue(json!("flaky")).unwrap();
    h.server.reject(json!("flaky"));

    let first = h.sync.flush().await;
    assert_eq!(first.failed, 1);
    assert_eq!(h.server.save_calls(), 1);

    h.server.clear_rejections();
    let second = h.sync.flush().await;
    assert_eq!(second.succeeded, 1);
    assert_eq!(h.server.save_calls(), 2);
    assert!(!h.queue.is_pending(&entry.id).unwrap());
  }

  #[tokio::test]
  async fn test_save_online_delivers_immediately() {
    let h = harness(true).await;
    let outcome = h.sync.save(json!({ "team": "254" })).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Synced(_)));
    assert!(pending_ids(&h).is_empty());
    assert_eq!(h.server.saved(), vec![json!({ "team": "254" })]);
  }

  #[tokio::test]
  async fn test_save_online_rejected_stays_local() {
    let h = harness(true).await;
    h.server.reject(json!("bad"));
    let outcome = h.sync.save(json!("bad")).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::SavedLocally(_)));
    assert_eq!(pending_ids(&h).len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_flush_runs_once() {
    let h = harness(true).await;
    h.queue.enqueue(json!(1)).unwrap();
    h.server.set_save_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(h.sync.flush(), h.sync.flush());
    assert!(a.already_running != b.already_running);
    assert_eq!(h.server.save_calls(), 1);
  }

  #[tokio::test]
  async fn test_in_flight_entry_is_not_sent_twice() {
    let h = harness(true).await;
    let entry = h.queue.enqueue(json!(1)).unwrap();

    let guard = h.queue.begin_sync(&entry.id).unwrap();
    let summary = h.sync.flush().await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.server.save_calls(), 0);
    drop(guard);

    assert_eq!(h.sync.flush().await.succeeded, 1);
  }

  #[tokio::test]
  async fn test_save_racing_flush_delivers_once() {
    let h = harness(true).await;
    h.server.set_save_delay(Duration::from_millis(30));
    h.queue.enqueue(json!("queued")).unwrap();

    let (outcome, summary) = tokio::join!(h.sync.save(json!("fresh")), h.sync.flush());

    assert!(matches!(outcome.unwrap(), SaveOutcome::Synced(_)));
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(h.server.save_calls(), 2);
    assert!(pending_ids(&h).is_empty());
  }

  #[tokio::test]
  async fn test_flush_refreshes_stale_reference() {
    let h = harness(true).await;
    assert!(h.reference.is_stale());
    let summary = h.sync.flush().await;
    assert_eq!(summary.refresh, Some(RefreshOutcome::Updated));
    assert!(!h.reference.is_stale());

    let again = h.sync.flush().await;
    assert_eq!(again.refresh, None);
  }

  #[tokio::test]
  async fn test_flush_prunes_old_synced_entries() {
    let h = harness(true).await;
    let old = h
      .queue
      .enqueue_at(json!("old"), chrono::Utc::now() - chrono::Duration::days(9))
      .unwrap();
    h.queue.mark_synced(&old.id).unwrap();

    let summary = h.sync.flush().await;
    assert_eq!(summary.pruned, 1);
    assert_eq!(h.queue.stats().unwrap().synced, 0);
  }

  #[tokio::test]
  async fn test_reconnect_triggers_flush() {
    let h = harness(false).await;
    h.queue.enqueue(json!("while offline")).unwrap();
    let mut events = h.sync.subscribe();

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&h.sync).run(Duration::from_secs(3600), stop_rx));

    h.server.set_health(Some(json_health()));
    h.monitor.refresh().await;

    let summary = tokio::time::timeout(Duration::from_secs(2), async {
      loop {
        if let Ok(SyncEvent::Flushed(summary)) = events.recv().await {
          if !summary.aborted_offline {
            return summary;
          }
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(pending_ids(&h).is_empty());

    stop_tx.send(true).unwrap();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_background_precache_flag_gates_stale_check() {
    let h = harness(true).await;
    h.sync.prefs.set(Flag::BackgroundPrecache, false).unwrap();
    h.sync.stale_check().await;
    assert!(h.reference.get().is_none());

    h.sync.prefs.set(Flag::BackgroundPrecache, true).unwrap();
    h.sync.stale_check().await;
    assert!(h.reference.get().is_some());
  }

  #[test]
  fn test_summary_message() {
    let summary = FlushSummary {
      attempted: 3,
      succeeded: 2,
      failed: 1,
      ..Default::default()
    };
    assert_eq!(summary.message(), "synced 2 submission(s), 1 will retry later");
    assert_eq!(FlushSummary::default().message(), "nothing to sync");
  }
}
