//! Concurrent record cache with conflict-aware upserts
//!
//! The map supports lock-free reads/writes and weakly-consistent iteration,
//! so the flush engine can snapshot pending records and prefix scans can run
//! while readers and writers keep touching other keys. Exactly one record is
//! live per canonical key at any instant.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::prefix::PrefixIndex;
use crate::record::PropertyRecord;

/// Outcome of a conflict resolution between a resident record and a candidate.
fn resolve(resident: &mut PropertyRecord, candidate: PropertyRecord) {
  // An absence placeholder never outranks a real write, in either direction:
  // losing a buffered write to a cached miss would drop it permanently.
  if resident.known_absent() && candidate.is_pending() {
    *resident = candidate;
    return;
  }
  if candidate.known_absent() && resident.is_pending() {
    return;
  }

  // Equal values only advance the timestamp. Replacing would flip a confirmed
  // record back to pending on a no-op rewrite and force a redundant flush.
  if resident.value() == candidate.value() {
    resident.advance_observed_at(candidate.observed_at());
    return;
  }

  // Last write wins by wall-clock time; the candidate takes exact ties.
  if candidate.observed_at() >= resident.observed_at() {
    *resident = candidate;
  }
}

/// The shared key/value cache: canonical key to live [`PropertyRecord`],
/// plus the prefix-completeness index.
#[derive(Default)]
pub struct PropertyCache {
  records: DashMap<String, PropertyRecord>,
  prefixes: PrefixIndex,
}

impl PropertyCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn prefix_index(&self) -> &PrefixIndex {
    &self.prefixes
  }

  /// Returns a clone of the live record for `key`, which must be canonical.
  pub fn get(&self, key: &str) -> Option<PropertyRecord> {
    self.records.get(key).map(|r| r.clone())
  }

  /// Inserts `candidate` or resolves the conflict with the resident record:
  /// later `observed_at` wins, equal values just advance the resident's
  /// timestamp. Returns the record now live for the key, which may be the
  /// candidate or the one that beat it; losing the race is not a failure.
  pub fn upsert(&self, candidate: PropertyRecord) -> PropertyRecord {
    match self.records.entry(candidate.key().to_string()) {
      Entry::Occupied(mut slot) => {
        resolve(slot.get_mut(), candidate);
        slot.get().clone()
      }
      Entry::Vacant(slot) => slot.insert(candidate).clone(),
    }
  }

  /// Unconditional replace, bypassing conflict resolution. Only for callers
  /// that have verified no write can race (e.g. single-threaded warmup);
  /// everything else goes through [`PropertyCache::upsert`].
  pub fn force_set(&self, record: PropertyRecord) {
    self.records.insert(record.key().to_string(), record);
  }

  /// Marks a flushed pending record as confirmed so it is not re-flushed.
  ///
  /// If a newer write with a different value raced in since the flush
  /// snapshot, it stays pending for the next cycle. If the key is no longer
  /// resident the confirmed form is inserted, which also serves the
  /// immediate-flush path where the record was flushed before entering the
  /// cache.
  pub fn promote(&self, flushed: &PropertyRecord) {
    match self.records.entry(flushed.key().to_string()) {
      Entry::Occupied(mut slot) => {
        let resident = slot.get_mut();
        if resident.is_pending() && resident.value() == flushed.value() {
          resident.mark_confirmed();
        }
      }
      Entry::Vacant(slot) => {
        slot.insert(flushed.clone().into_confirmed());
      }
    }
  }

  /// Removes the record for a canonical key.
  pub fn remove(&self, key: &str) -> Option<PropertyRecord> {
    self.records.remove(key).map(|(_, record)| record)
  }

  /// Removes the record unless it is a buffered write awaiting flush. An
  /// invalidation must not drop a record that is neither durable nor
  /// re-creatable from the store.
  pub fn remove_unless_pending(&self, key: &str) -> Option<PropertyRecord> {
    self
      .records
      .remove_if(key, |_, record| !record.is_pending())
      .map(|(_, record)| record)
  }

  /// Removes every resident key sharing `prefix` and invalidates the prefix
  /// index first, so no load can re-register completeness mid-removal.
  ///
  /// The scan is weakly consistent: keys inserted while it runs may survive,
  /// but any key present before and after the scan is removed.
  pub fn remove_by_prefix(&self, prefix: &str) -> usize {
    self.prefixes.purge(prefix);

    let doomed: Vec<String> = self
      .records
      .iter()
      .filter(|entry| entry.key().starts_with(prefix))
      .map(|entry| entry.key().clone())
      .collect();

    let mut removed = 0;
    for key in doomed {
      if self.records.remove(&key).is_some() {
        removed += 1;
      }
    }
    removed
  }

  /// Point-in-time snapshot of all pending records. Taken via weakly
  /// consistent iteration; concurrent inserts elsewhere in the map are not
  /// blocked.
  pub fn select_pending(&self) -> Vec<PropertyRecord> {
    self
      .records
      .iter()
      .filter(|entry| entry.value().is_pending())
      .map(|entry| entry.value().clone())
      .collect()
  }

  /// Resident keys sharing `prefix`, excluding known-absent placeholders and
  /// empty values: callers must never see a cached miss as a real key.
  pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
    self
      .records
      .iter()
      .filter(|entry| entry.key().starts_with(prefix))
      .filter(|entry| !entry.value().known_absent() && !entry.value().value().is_empty())
      .map(|entry| entry.key().clone())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}
