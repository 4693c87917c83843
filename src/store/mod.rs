//! Durable local key-value storage.
//!
//! Every component owns a disjoint key prefix (`reference:`, `queue:`,
//! `prefs:`). Writes are last-writer-wins per key; a `WriteBatch` is applied
//! in a single transaction so multi-key updates are all-or-nothing. Updates
//! that depend on what is already stored go through
//! [`KeyValueStore::transact`], which holds the database write lock from the
//! first read to the commit, so another process sharing the file cannot
//! interleave.

mod sqlite;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

pub use sqlite::SqliteStore;

/// A single mutation inside a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
  Put { key: String, value: Vec<u8> },
  Delete { key: String },
}

/// Ordered set of mutations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
  ops: Vec<WriteOp>,
}

impl WriteBatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
    self.ops.push(WriteOp::Put {
      key: key.into(),
      value,
    });
    self
  }

  /// Serialize `value` as JSON and queue a put.
  pub fn put_json<T: Serialize>(self, key: impl Into<String>, value: &T) -> Result<Self, StorageError> {
    let key = key.into();
    let data = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
      key: key.clone(),
      source,
    })?;
    Ok(self.put(key, data))
  }

  pub fn delete(mut self, key: impl Into<String>) -> Self {
    self.ops.push(WriteOp::Delete { key: key.into() });
    self
  }

  pub fn ops(&self) -> &[WriteOp] {
    &self.ops
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }
}

/// Outcome of reading a JSON value that may have been corrupted on disk.
#[derive(Debug)]
pub enum Decoded<T> {
  Missing,
  Value(T),
  /// Bytes exist but do not parse as `T`.
  Corrupt(serde_json::Error),
}

fn decode<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Decoded<T> {
  match bytes {
    None => Decoded::Missing,
    Some(bytes) => match serde_json::from_slice(&bytes) {
      Ok(value) => Decoded::Value(value),
      Err(e) => Decoded::Corrupt(e),
    },
  }
}

/// Reads made inside a [`KeyValueStore::transact`] call.
pub trait StoreRead {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

impl dyn StoreRead + '_ {
  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Decoded<T>, StorageError> {
    Ok(decode(self.get(key)?))
  }
}

/// Trait for durable key-value backends.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw bytes stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// List keys starting with `prefix`, sorted ascending.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

  /// Apply all operations of `batch` atomically.
  fn apply(&self, batch: WriteBatch) -> Result<(), StorageError>;

  /// Read through `f`, then apply the batch it returns, as one exclusive
  /// transaction. Nothing is written if `f` fails.
  fn transact<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    Self: Sized,
    F: FnOnce(&dyn StoreRead) -> Result<(WriteBatch, T), StorageError>;

  fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
    self.apply(WriteBatch::new().put(key, value))
  }

  fn delete(&self, key: &str) -> Result<(), StorageError> {
    self.apply(WriteBatch::new().delete(key))
  }

  fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError>
  where
    Self: Sized,
  {
    self.apply(WriteBatch::new().put_json(key, value)?)
  }

  fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Decoded<T>, StorageError>
  where
    Self: Sized,
  {
    Ok(decode(self.get(key)?))
  }
}

impl<S: KeyValueStore> KeyValueStore for std::sync::Arc<S> {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    (**self).get(key)
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    (**self).keys_with_prefix(prefix)
  }

  fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
    (**self).apply(batch)
  }

  fn transact<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    F: FnOnce(&dyn StoreRead) -> Result<(WriteBatch, T), StorageError>,
  {
    (**self).transact(f)
  }
}
