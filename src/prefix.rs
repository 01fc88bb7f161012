//! Prefix index: completeness witness for prefix queries
//!
//! A registered prefix means every live key in the backing store starting
//! with it is resident in the cache, so prefix queries can be answered from
//! cache alone. Registration happens only after a full load, and loads for
//! overlapping prefixes are serialized through [`PrefixIndex::load_guard`].

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Tracks which canonical key-prefixes are fully materialized in the cache.
#[derive(Default)]
pub struct PrefixIndex {
  prefixes: Mutex<Vec<String>>,
  load_lock: AsyncMutex<()>,
}

impl PrefixIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// True when some registered prefix is a prefix of (or equal to) `prefix`,
  /// meaning the cache already holds every store key matching it.
  pub fn covers(&self, prefix: &str) -> bool {
    self.prefixes.lock().iter().any(|p| prefix.starts_with(p.as_str()))
  }

  /// True when `key` falls under any registered prefix. Used by the
  /// changed-key handler: such keys must be reloaded, not just evicted,
  /// or the completeness claim would break.
  pub fn covering(&self, key: &str) -> bool {
    self.prefixes.lock().iter().any(|p| key.starts_with(p.as_str()))
  }

  /// Records `prefix` as fully loaded. Idempotent.
  pub fn register(&self, prefix: &str) {
    let mut prefixes = self.prefixes.lock();
    if !prefixes.iter().any(|p| p == prefix) {
      prefixes.push(prefix.to_string());
    }
  }

  /// Drops every entry that is a prefix of `prefix` or is prefixed by it.
  /// Called before a delete-by-prefix may race with a load.
  pub fn purge(&self, prefix: &str) {
    self
      .prefixes
      .lock()
      .retain(|p| !(p.starts_with(prefix) || prefix.starts_with(p.as_str())));
  }

  /// Serializes prefix materialization. Held across the backing-store read
  /// so overlapping loads cannot interleave with each other or with the
  /// changed-key reload path.
  pub async fn load_guard(&self) -> AsyncMutexGuard<'_, ()> {
    self.load_lock.lock().await
  }

  #[cfg(test)]
  pub(crate) fn entries(&self) -> Vec<String> {
    self.prefixes.lock().clone()
  }
}
