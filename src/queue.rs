//! Offline submission queue.
//!
//! Storage layout: `queue:index` holds the metadata of every entry in
//! creation order, and `queue:entry:<id>` holds the full envelope with the
//! opaque payload. Both are written in one batch, so an entry is either fully
//! queued or not queued at all. Every index read-modify-write runs in a single
//! store transaction, since the dashboard and one-shot CLI commands share the
//! same database file.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::store::{Decoded, KeyValueStore, StoreRead, WriteBatch};

const INDEX_KEY: &str = "queue:index";
const ENTRY_PREFIX: &str = "queue:entry:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Pending,
  Synced,
}

/// A queued form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  pub id: String,
  pub created_at: DateTime<Utc>,
  pub payload: serde_json::Value,
  pub sync_state: SyncState,
  #[serde(default)]
  pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
  id: String,
  created_at: DateTime<Utc>,
  sync_state: SyncState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub synced: usize,
}

/// Marks an entry as being synced; the mark is cleared on drop.
pub struct InFlightGuard<'a> {
  set: &'a Mutex<HashSet<String>>,
  id: String,
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    if let Ok(mut set) = self.set.lock() {
      set.remove(&self.id);
    }
  }
}

pub struct SubmissionQueue<S: KeyValueStore> {
  store: Arc<S>,
  retention: Duration,
  in_flight: Mutex<HashSet<String>>,
}

impl<S: KeyValueStore> SubmissionQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      retention: Duration::days(7),
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  pub fn with_retention(mut self, retention: Duration) -> Self {
    self.retention = retention;
    self
  }

  /// Durably queue `payload` as a new pending entry.
  pub fn enqueue(&self, payload: serde_json::Value) -> Result<QueueEntry, StorageError> {
    self.enqueue_at(payload, Utc::now())
  }

  pub fn enqueue_at(
    &self,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
  ) -> Result<QueueEntry, StorageError> {
    let entry = self.store.transact(|reader| {
      let (mut index, batch) = load_index(reader)?;

      let entry = QueueEntry {
        id: next_id(&index, created_at),
        created_at,
        payload,
        sync_state: SyncState::Pending,
        synced_at: None,
      };
      index.push(IndexEntry {
        id: entry.id.clone(),
        created_at,
        sync_state: SyncState::Pending,
      });

      let batch = batch
        .put_json(entry_key(&entry.id), &entry)?
        .put_json(INDEX_KEY, &index)?;
      Ok((batch, entry))
    })?;

    info!(id = %entry.id, "Submission queued");
    Ok(entry)
  }

  /// Pending entries, oldest first.
  pub fn list_pending(&self) -> Result<Vec<QueueEntry>, StorageError> {
    self.store.transact(|reader| {
      let (index, batch) = load_index(reader)?;
      let mut pending: Vec<IndexEntry> = index
        .into_iter()
        .filter(|e| e.sync_state == SyncState::Pending)
        .collect();
      pending.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

      let mut entries = Vec::with_capacity(pending.len());
      for meta in pending {
        match reader.get_json::<QueueEntry>(&entry_key(&meta.id))? {
          Decoded::Value(entry) => entries.push(entry),
          Decoded::Missing => warn!(id = %meta.id, "Queued entry has no payload, skipping"),
          Decoded::Corrupt(e) => warn!(id = %meta.id, error = %e, "Unreadable queued entry, skipping"),
        }
      }
      Ok((batch, entries))
    })
  }

  /// Mark `id` as acknowledged by the server. Returns whether anything changed.
  pub fn mark_synced(&self, id: &str) -> Result<bool, StorageError> {
    let changed = self.store.transact(|reader| {
      let (mut index, batch) = load_index(reader)?;

      let Some(meta) = index.iter_mut().find(|e| e.id == id) else {
        debug!(id, "Ignoring mark_synced for unknown entry");
        return Ok((batch, false));
      };
      if meta.sync_state == SyncState::Synced {
        return Ok((batch, false));
      }
      meta.sync_state = SyncState::Synced;

      let mut batch = batch;
      if let Decoded::Value(mut entry) = reader.get_json::<QueueEntry>(&entry_key(id))? {
        entry.sync_state = SyncState::Synced;
        entry.synced_at = Some(Utc::now());
        batch = batch.put_json(entry_key(id), &entry)?;
      }
      Ok((batch.put_json(INDEX_KEY, &index)?, true))
    })?;

    if changed {
      debug!(id, "Submission marked synced");
    }
    Ok(changed)
  }

  pub fn prune(&self) -> Result<usize, StorageError> {
    self.prune_at(Utc::now())
  }

  /// Delete synced entries created before `now - retention`. Pending entries are never touched.
  pub fn prune_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let cutoff = now - self.retention;
    let pruned = self.store.transact(|reader| {
      let (index, mut batch) = load_index(reader)?;

      let (expired, kept): (Vec<_>, Vec<_>) = index
        .into_iter()
        .partition(|e| e.sync_state == SyncState::Synced && e.created_at < cutoff);

      if expired.is_empty() {
        return Ok((batch, 0));
      }
      for entry in &expired {
        batch = batch.delete(entry_key(&entry.id));
      }
      Ok((batch.put_json(INDEX_KEY, &kept)?, expired.len()))
    })?;

    if pruned > 0 {
      info!(pruned, "Pruned synced submissions");
    }
    Ok(pruned)
  }

  pub fn is_pending(&self, id: &str) -> Result<bool, StorageError> {
    Ok(
      self
        .read_index()?
        .iter()
        .any(|e| e.id == id && e.sync_state == SyncState::Pending),
    )
  }

  pub fn stats(&self) -> Result<QueueStats, StorageError> {
    let index = self.read_index()?;
    let pending = index
      .iter()
      .filter(|e| e.sync_state == SyncState::Pending)
      .count();
    Ok(QueueStats {
      pending,
      synced: index.len() - pending,
    })
  }

  /// Claim `id` for a sync attempt, or `None` if another attempt is in flight.
  pub fn begin_sync(&self, id: &str) -> Option<InFlightGuard<'_>> {
    let mut set = self.in_flight.lock().ok()?;
    if !set.insert(id.to_string()) {
      return None;
    }
    Some(InFlightGuard {
      set: &self.in_flight,
      id: id.to_string(),
    })
  }

  pub fn is_in_flight(&self, id: &str) -> bool {
    self
      .in_flight
      .lock()
      .map(|set| set.contains(id))
      .unwrap_or(false)
  }

  fn read_index(&self) -> Result<Vec<IndexEntry>, StorageError> {
    self
      .store
      .transact(|reader| load_index(reader).map(|(index, batch)| (batch, index)))
  }
}

/// Read the index, rebuilding it from entry blobs when it is missing or
/// unreadable. A rebuilt corrupt index comes back queued in the batch.
fn load_index(reader: &dyn StoreRead) -> Result<(Vec<IndexEntry>, WriteBatch), StorageError> {
  match reader.get_json::<Vec<IndexEntry>>(INDEX_KEY)? {
    Decoded::Value(index) => Ok((index, WriteBatch::new())),
    Decoded::Missing => Ok((rebuild_index(reader)?, WriteBatch::new())),
    Decoded::Corrupt(e) => {
      warn!(error = %e, "Queue index unreadable, rebuilding from entries");
      let index = rebuild_index(reader)?;
      let batch = WriteBatch::new().put_json(INDEX_KEY, &index)?;
      Ok((index, batch))
    }
  }
}

/// Reconstruct the index by scanning entry blobs.
fn rebuild_index(reader: &dyn StoreRead) -> Result<Vec<IndexEntry>, StorageError> {
  let mut index = Vec::new();
  for key in reader.keys_with_prefix(ENTRY_PREFIX)? {
    match reader.get_json::<QueueEntry>(&key)? {
      Decoded::Value(entry) => index.push(IndexEntry {
        id: entry.id,
        created_at: entry.created_at,
        sync_state: entry.sync_state,
      }),
      Decoded::Corrupt(e) => warn!(key = %key, error = %e, "Skipping unreadable queue entry"),
      Decoded::Missing => {}
    }
  }
  index.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
  Ok(index)
}

fn entry_key(id: &str) -> String {
  format!("{}{}", ENTRY_PREFIX, id)
}

/// Millisecond timestamp, bumped past the largest existing id so ids never repeat.
fn next_id(index: &[IndexEntry], created_at: DateTime<Utc>) -> String {
  let newest = index
    .iter()
    .filter_map(|e| e.id.parse::<u64>().ok())
    .max()
    .unwrap_or(0);
  let millis = u64::try_from(created_at.timestamp_millis()).unwrap_or(0);
  // Zero-padded so lexical key order matches numeric order.
  format!("{:016}", millis.max(newest + 1))
}
