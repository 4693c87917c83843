//! User preference flags persisted under the `prefs:` prefix.

use std::sync::Arc;
use tracing::warn;

use crate::error::StorageError;
use crate::store::{Decoded, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
  /// Refresh reference data in the background when it goes stale.
  BackgroundPrecache,
}

impl Flag {
  fn key(&self) -> &'static str {
    match self {
      Flag::BackgroundPrecache => "prefs:background_precache",
    }
  }

  fn default_value(&self) -> bool {
    match self {
      Flag::BackgroundPrecache => true,
    }
  }
}

pub struct Preferences<S: KeyValueStore> {
  store: Arc<S>,
}

impl<S: KeyValueStore> Preferences<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  /// Read a flag, falling back to its default when unset or unreadable.
  pub fn get(&self, flag: Flag) -> bool {
    match self.store.get_json::<bool>(flag.key()) {
      Ok(Decoded::Value(v)) => v,
      Ok(Decoded::Missing) => flag.default_value(),
      Ok(Decoded::Corrupt(e)) => {
        warn!(key = flag.key(), error = %e, "Ignoring corrupt preference");
        flag.default_value()
      }
      Err(e) => {
        warn!(key = flag.key(), error = %e, "Failed to read preference");
        flag.default_value()
      }
    }
  }

  pub fn set(&self, flag: Flag, value: bool) -> Result<(), StorageError> {
    self.store.put_json(flag.key(), &value)
  }
}
