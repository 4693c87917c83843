//! Error taxonomy for the sync layer.
//!
//! Connectivity failures never surface as errors (they become
//! `ConnectivityState::Unreachable`), and per-entry sync failures are folded
//! into a `FlushSummary`. Only storage failures that would lose user data are
//! returned to callers.

use thiserror::Error;

/// Failure writing to or reading from durable local storage.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The backing store refused the write because it is full.
  #[error("local storage quota exceeded")]
  QuotaExceeded,
  /// The backing store could not be opened or is disabled.
  #[error("local storage unavailable: {0}")]
  Unavailable(String),
  #[error("storage backend error: {0}")]
  Backend(#[from] rusqlite::Error),
  #[error("failed to encode value for key {key}: {source}")]
  Encode {
    key: String,
    #[source]
    source: serde_json::Error,
  },
}

impl StorageError {
  /// Map SQLite "database or disk is full" onto the quota variant.
  pub fn from_sqlite(err: rusqlite::Error) -> Self {
    match err {
      rusqlite::Error::SqliteFailure(ref e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
        StorageError::QuotaExceeded
      }
      other => StorageError::Backend(other),
    }
  }
}

/// Failure talking to the scouting server.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(String),
  #[error("server returned status {0}")]
  Status(u16),
  #[error("server rejected the request")]
  Rejected,
  #[error("unexpected response: {0}")]
  Schema(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      TransportError::Timeout
    } else if let Some(status) = err.status() {
      TransportError::Status(status.as_u16())
    } else if err.is_decode() {
      TransportError::Schema(err.to_string())
    } else {
      TransportError::Network(err.to_string())
    }
  }
}

/// Failure in the asset worker lifecycle.
#[derive(Debug, Error)]
pub enum AssetError {
  #[error("failed to precache {url}: {reason}")]
  InstallFailed { url: String, reason: String },
  #[error("cannot move worker from {from} to {to}")]
  InvalidTransition {
    from: &'static str,
    to: &'static str,
  },
  #[error(transparent)]
  Storage(#[from] StorageError),
}
