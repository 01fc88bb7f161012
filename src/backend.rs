//! Backing store trait and the in-memory implementation
//!
//! The relational store sits behind this trait: transactional per call, one
//! authoritative store per logical partition.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{BackendError, BackendResult};

/// A key/value row as stored in the backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRow {
  pub key: String,
  pub value: String,
}

impl PropertyRow {
  pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      value: value.into(),
    }
  }
}

/// The abstract upsert/select/delete surface of the backing store.
#[async_trait]
pub trait PropertyBackend: Send + Sync {
  /// Reads one row. `Ok(None)` means the key does not exist.
  async fn read_one(&self, key: &str) -> BackendResult<Option<String>>;

  /// Reads every row whose key starts with `prefix`.
  async fn read_prefix(&self, prefix: &str) -> BackendResult<Vec<PropertyRow>>;

  /// Upserts rows one at a time inside a single session and returns a
  /// per-row success flag. A failing row must not abort the rest of the
  /// batch; an `Err` means the session itself could not be established and
  /// nothing was written.
  async fn upsert_batch(&self, rows: &[PropertyRow]) -> BackendResult<Vec<bool>>;

  /// Deletes one key, or every key under a prefix.
  async fn delete(&self, key: &str, is_prefix: bool) -> BackendResult<()>;
}

/// BTreeMap-backed store for tests and embedded use.
///
/// Failure injection mirrors what the cache has to survive: a store that is
/// down entirely (`set_unavailable`), individual rows that fail to upsert
/// (`fail_upserts_for`), and slow sessions (`set_session_delay`) for
/// exercising overlapping flush ticks.
#[derive(Default)]
pub struct MemoryBackend {
  rows: RwLock<BTreeMap<String, String>>,
  failing_keys: RwLock<HashSet<String>>,
  unavailable: AtomicBool,
  session_delay: RwLock<Option<Duration>>,
  sessions: AtomicUsize,
  reads: AtomicUsize,
  prefix_reads: AtomicUsize,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seeds a row without going through the cache, as a remote peer would.
  pub fn put(&self, key: &str, value: &str) {
    self.rows.write().insert(key.to_string(), value.to_string());
  }

  /// Makes every call return [`BackendError::Unavailable`].
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Makes upserts of `key` fail while leaving the rest of the batch alone.
  pub fn fail_upserts_for(&self, key: &str) {
    self.failing_keys.write().insert(key.to_string());
  }

  /// Stalls every upsert session by `delay`.
  pub fn set_session_delay(&self, delay: Option<Duration>) {
    *self.session_delay.write() = delay;
  }

  /// Number of upsert sessions opened so far.
  pub fn sessions(&self) -> usize {
    self.sessions.load(Ordering::SeqCst)
  }

  /// Number of single-row reads served so far.
  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  /// Number of prefix scans served so far.
  pub fn prefix_reads(&self) -> usize {
    self.prefix_reads.load(Ordering::SeqCst)
  }

  /// Snapshot of all rows, for assertions.
  pub fn dump(&self) -> Vec<PropertyRow> {
    self
      .rows
      .read()
      .iter()
      .map(|(k, v)| PropertyRow::new(k.clone(), v.clone()))
      .collect()
  }

  pub fn value_of(&self, key: &str) -> Option<String> {
    self.rows.read().get(key).cloned()
  }

  fn check_available(&self) -> BackendResult<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(BackendError::Unavailable("backend marked unavailable".into()));
    }
    Ok(())
  }
}

#[async_trait]
impl PropertyBackend for MemoryBackend {
  async fn read_one(&self, key: &str) -> BackendResult<Option<String>> {
    self.check_available()?;
    self.reads.fetch_add(1, Ordering::SeqCst);
    Ok(self.rows.read().get(key).cloned())
  }

  async fn read_prefix(&self, prefix: &str) -> BackendResult<Vec<PropertyRow>> {
    self.check_available()?;
    self.prefix_reads.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .rows
        .read()
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| PropertyRow::new(k.clone(), v.clone()))
        .collect(),
    )
  }

  async fn upsert_batch(&self, rows: &[PropertyRow]) -> BackendResult<Vec<bool>> {
    self.check_available()?;
    self.sessions.fetch_add(1, Ordering::SeqCst);

    let delay = *self.session_delay.read();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let mut outcomes = Vec::with_capacity(rows.len());
    for row in rows {
      if self.failing_keys.read().contains(&row.key) {
        outcomes.push(false);
        continue;
      }
      self.rows.write().insert(row.key.clone(), row.value.clone());
      outcomes.push(true);
    }
    Ok(outcomes)
  }

  async fn delete(&self, key: &str, is_prefix: bool) -> BackendResult<()> {
    self.check_available()?;
    let mut rows = self.rows.write();
    if is_prefix {
      rows.retain(|k, _| !k.starts_with(key));
    } else {
      rows.remove(key);
    }
    Ok(())
  }
}
