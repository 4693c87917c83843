//! Cache storage for shell assets: named caches of URL -> response.
//!
//! Lives in its own SQLite file, separate from the key-value store, and is
//! owned entirely by the asset worker.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::network::AssetResponse;
use crate::error::StorageError;

const ASSET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url_hash),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);
"#;

pub struct CacheStorage {
  conn: Mutex<Connection>,
}

impl CacheStorage {
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

  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory().map_err(StorageError::from_sqlite)?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(StorageError::from_sqlite)?;
    conn
      .execute_batch(ASSET_SCHEMA)
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

  /// Names of every cache, sorted.
  pub fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY name")
      .map_err(StorageError::from_sqlite)?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(StorageError::from_sqlite)?
      .collect::<Result<Vec<String>, _>>()
      .map_err(StorageError::from_sqlite)?;
    Ok(names)
  }

  /// Delete a cache and all of its entries. Returns whether it existed.
  pub fn delete_cache(&self, name: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(StorageError::from_sqlite)?;
    Ok(removed > 0)
  }

  /// Store several responses in one transaction.
  pub fn put_all(&self, cache: &str, entries: &[(String, AssetResponse)]) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(StorageError::from_sqlite)?;

    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(StorageError::from_sqlite)?;

    for (url, response) in entries {
      let headers = serde_json::to_string(&response.headers).map_err(|source| {
        StorageError::Encode {
          key: url.clone(),
          source,
        }
      })?;
      tx.execute(
        "INSERT OR REPLACE INTO cache_entries (cache_name, url_hash, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![cache, url_hash(url), url, response.status, headers, response.body],
      )
      .map_err(StorageError::from_sqlite)?;
    }

    tx.commit().map_err(StorageError::from_sqlite)?;
    Ok(())
  }

  pub fn put(&self, cache: &str, url: &str, response: &AssetResponse) -> Result<(), StorageError> {
    self.put_all(cache, &[(url.to_string(), response.clone())])
  }

  /// Look up the response stored for exactly `url`.
  ///
  /// An entry whose headers no longer parse is treated as a miss.
  pub fn match_url(&self, cache: &str, url: &str) -> Result<Option<AssetResponse>, StorageError> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries WHERE cache_name = ? AND url_hash = ?",
        params![cache, url_hash(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(StorageError::from_sqlite)?;

    Ok(row.and_then(|(status, headers, body)| {
      serde_json::from_str(&headers)
        .ok()
        .map(|headers| AssetResponse {
          status,
          headers,
          body,
        })
    }))
  }

  /// URLs stored in `cache`, sorted.
  pub fn keys(&self, cache: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(StorageError::from_sqlite)?;
    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(StorageError::from_sqlite)?
      .collect::<Result<Vec<String>, _>>()
      .map_err(StorageError::from_sqlite)?;
    Ok(urls)
  }
}

/// SHA256 of the URL for stable, fixed-length keys.
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}
