//! Reference cache that keeps the last good snapshot for offline use.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{StorageError, TransportError};
use crate::reachability::ConnectivityState;
use crate::server::ScoutingServer;
use crate::store::{Decoded, KeyValueStore, WriteBatch};

use super::types::{template_pair, ReferenceSnapshot, Team};

const SNAPSHOT_KEY: &str = "reference:snapshot";
const FETCHED_AT_KEY: &str = "reference:fetched_at";

/// What a call to [`ReferenceCache::refresh`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
  Updated,
  SkippedOffline,
  /// The server could not provide a complete snapshot; the previous one is kept.
  Failed(String),
}

/// Where the reference data handed to a caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Memory,
  Storage,
}

/// Local reference cache with an in-memory tier over durable storage.
pub struct ReferenceCache<S: KeyValueStore> {
  store: Arc<S>,
  server: Arc<dyn ScoutingServer>,
  connectivity: watch::Receiver<ConnectivityState>,
  memory: RwLock<Option<Arc<ReferenceSnapshot>>>,
  freshness: Duration,
}

impl<S: KeyValueStore> ReferenceCache<S> {
  pub fn new(
    store: Arc<S>,
    server: Arc<dyn ScoutingServer>,
    connectivity: watch::Receiver<ConnectivityState>,
  ) -> Self {
    Self {
      store,
      server,
      connectivity,
      memory: RwLock::new(None),
      freshness: Duration::hours(24),
    }
  }

  /// Set how long a snapshot counts as fresh.
  pub fn with_freshness(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  /// Fetch a complete snapshot and replace the stored one.
  ///
  /// Network failures are logged and reported as an outcome; only a failed
  /// storage write is an error, since the caller may want to surface it.
  pub async fn refresh(&self) -> Result<RefreshOutcome, StorageError> {
    if *self.connectivity.borrow() != ConnectivityState::Reachable {
      debug!("Skipping reference refresh while offline");
      return Ok(RefreshOutcome::SkippedOffline);
    }

    let snapshot = match self.fetch_snapshot().await {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!(error = %e, "Reference refresh failed, keeping previous snapshot");
        return Ok(RefreshOutcome::Failed(e.to_string()));
      }
    };

    self.store_snapshot(snapshot)?;
    Ok(RefreshOutcome::Updated)
  }

  async fn fetch_snapshot(&self) -> Result<ReferenceSnapshot, TransportError> {
    let (teams, matches, scoring_config) = tokio::try_join!(
      self.server.teams(),
      self.server.matches(),
      self.server.scoring_config()
    )?;

    let form_template_markup = match template_pair(&teams, &matches) {
      Some((team, match_id)) => self.server.render_form(&team, &match_id).await?,
      None => {
        warn!("No team/match pair available, caching an empty form template");
        String::new()
      }
    };

    Ok(ReferenceSnapshot {
      teams,
      matches,
      scoring_config,
      form_template_markup,
      fetched_at: Utc::now(),
    })
  }

  /// Persist `snapshot` and the fetch timestamp in one transaction, then publish it in memory.
  pub fn store_snapshot(&self, snapshot: ReferenceSnapshot) -> Result<(), StorageError> {
    let batch = WriteBatch::new()
      .put_json(SNAPSHOT_KEY, &snapshot)?
      .put_json(FETCHED_AT_KEY, &snapshot.fetched_at)?;
    self.store.apply(batch)?;

    info!(
      teams = snapshot.teams.len(),
      matches = snapshot.matches.len(),
      "Reference snapshot stored"
    );
    if let Ok(mut memory) = self.memory.write() {
      *memory = Some(Arc::new(snapshot));
    }
    Ok(())
  }

  /// Current snapshot, or `None` if never populated. Never touches the network.
  pub fn get(&self) -> Option<Arc<ReferenceSnapshot>> {
    self.get_with_source().map(|(snapshot, _)| snapshot)
  }

  pub fn get_with_source(&self) -> Option<(Arc<ReferenceSnapshot>, CacheSource)> {
    if let Some(snapshot) = self.current_memory() {
      return Some((snapshot, CacheSource::Memory));
    }

    let loaded = match self.store.get_json::<ReferenceSnapshot>(SNAPSHOT_KEY) {
      Ok(Decoded::Value(snapshot)) => Arc::new(snapshot),
      Ok(Decoded::Missing) => return None,
      Ok(Decoded::Corrupt(e)) => {
        warn!(error = %e, "Discarding corrupt reference snapshot");
        self.discard();
        return None;
      }
      Err(e) => {
        warn!(error = %e, "Failed to read reference snapshot");
        return None;
      }
    };

    if let Ok(mut memory) = self.memory.write() {
      *memory = Some(Arc::clone(&loaded));
    }
    Some((loaded, CacheSource::Storage))
  }

  /// When the current snapshot was fetched, if known.
  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    if let Some(snapshot) = self.current_memory() {
      return Some(snapshot.fetched_at);
    }
    self.stored_fetched_at().ok().flatten()
  }

  fn stored_fetched_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
    Ok(match self.store.get_json::<DateTime<Utc>>(FETCHED_AT_KEY)? {
      Decoded::Value(at) => Some(at),
      Decoded::Missing => None,
      Decoded::Corrupt(e) => {
        warn!(error = %e, "Ignoring corrupt reference timestamp");
        None
      }
    })
  }

  /// The in-memory snapshot, if storage still holds the same fetch.
  ///
  /// Another process may have refreshed or cleared the shared store; the
  /// stored timestamp tells us whether the memory copy is still current.
  fn current_memory(&self) -> Option<Arc<ReferenceSnapshot>> {
    let snapshot = self.memory.read().ok().and_then(|m| m.clone())?;
    match self.stored_fetched_at() {
      Ok(Some(at)) if at == snapshot.fetched_at => Some(snapshot),
      Ok(_) => {
        debug!("Reference snapshot changed in storage, dropping memory copy");
        if let Ok(mut memory) = self.memory.write() {
          *memory = None;
        }
        None
      }
      Err(e) => {
        warn!(error = %e, "Failed to read reference timestamp, using memory copy");
        Some(snapshot)
      }
    }
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Utc::now())
  }

  /// Stale once `now` reaches `fetched_at + freshness`, or when nothing was fetched.
  pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
    match self.fetched_at() {
      Some(at) => now >= at + self.freshness,
      None => true,
    }
  }

  /// Teams in either alliance of `match_id`, or all teams when the match is absent or unknown.
  pub fn filter_teams_for_match(&self, match_id: Option<&str>) -> Vec<Team> {
    match self.get() {
      Some(snapshot) => snapshot
        .teams_for_match(match_id)
        .into_iter()
        .cloned()
        .collect(),
      None => Vec::new(),
    }
  }

  /// Remove the snapshot from every tier.
  pub fn clear(&self) -> Result<(), StorageError> {
    self
      .store
      .apply(WriteBatch::new().delete(SNAPSHOT_KEY).delete(FETCHED_AT_KEY))?;
    if let Ok(mut memory) = self.memory.write() {
      *memory = None;
    }
    Ok(())
  }

  fn discard(&self) {
    if let Err(e) = self.clear() {
      warn!(error = %e, "Failed to discard reference snapshot");
    }
  }
}
