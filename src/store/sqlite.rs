//! SQLite-backed key-value store.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{KeyValueStore, StoreRead, WriteBatch, WriteOp};
use crate::error::StorageError;

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// How long a writer waits for another connection's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based durable store shared by the reference cache, queue and prefs.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("failed to create {}: {}", parent.display(), e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!("failed to open {}: {}", path.display(), e))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory().map_err(StorageError::from_sqlite)?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(StorageError::from_sqlite)?;
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(StorageError::from_sqlite)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

impl StoreRead for Connection {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    self
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(StorageError::from_sqlite)
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = self
      .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(StorageError::from_sqlite)?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))
      .map_err(StorageError::from_sqlite)?
      .collect::<Result<Vec<_>, _>>()
      .map_err(StorageError::from_sqlite)?;

    Ok(keys)
  }
}

fn write_ops(conn: &Connection, batch: &WriteBatch) -> Result<(), StorageError> {
  for op in batch.ops() {
    match op {
      WriteOp::Put { key, value } => {
        conn
          .execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
            params![key, value],
          )
          .map_err(StorageError::from_sqlite)?;
      }
      WriteOp::Delete { key } => {
        conn
          .execute("DELETE FROM kv WHERE key = ?", params![key])
          .map_err(StorageError::from_sqlite)?;
      }
    }
  }
  Ok(())
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.lock()?;
    StoreRead::get(&*conn, key)
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    StoreRead::keys_with_prefix(&*conn, prefix)
  }

  fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
    if batch.is_empty() {
      return Ok(());
    }
    self.transact(|_| Ok((batch, ())))
  }

  fn transact<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    F: FnOnce(&dyn StoreRead) -> Result<(WriteBatch, T), StorageError>,
  {
    let mut conn = self.lock()?;
    // IMMEDIATE takes the write lock up front, so reads inside `f` cannot go
    // stale before the commit.
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(StorageError::from_sqlite)?;

    let (batch, value) = f(&*tx)?;
    write_ops(&tx, &batch)?;

    // Dropping `tx` without commit rolls back the partial batch.
    tx.commit().map_err(StorageError::from_sqlite)?;
    Ok(value)
  }
}
