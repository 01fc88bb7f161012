//! Property record types and key canonicalization

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::error::PropertyError;

/// Maximum key length accepted by the backing store's key column.
pub const MAX_KEY_CHARS: usize = 256;

/// Canonical form of a property key.
///
/// Key identity is case-insensitive; everything entering the cache (lookups,
/// inserts, removals, prefixes) goes through this function so that the map's
/// hashing agrees with the identity rule.
pub fn canonical_key(key: &str) -> String {
  key.to_uppercase()
}

fn validate_key(canonical: &str) -> Result<(), PropertyError> {
  if canonical.is_empty() {
    return Err(PropertyError::EmptyKey);
  }
  let chars = canonical.chars().count();
  if chars > MAX_KEY_CHARS {
    return Err(PropertyError::KeyTooLong(chars));
  }
  Ok(())
}

/// Distinguishes durable entries from buffered writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFlavor {
  /// Value reflects the backing store. `known_absent` marks a cached miss,
  /// stored to avoid repeated lookups for keys that do not exist.
  Confirmed { known_absent: bool },
  /// Local write not yet flushed. `suppress_notify` is set for writes that
  /// originated from a remote notification, to break notification loops.
  Pending { suppress_notify: bool },
}

/// A single cached property: canonical key, value and the wall-clock time the
/// value was produced. The empty string doubles as "known absent"; flavor is
/// the only reliable absence signal.
#[derive(Debug, Clone)]
pub struct PropertyRecord {
  key: String,
  value: String,
  observed_at: DateTime<Utc>,
  flavor: RecordFlavor,
}

impl PropertyRecord {
  fn new(key: &str, value: String, flavor: RecordFlavor) -> Result<Self, PropertyError> {
    let key = canonical_key(key);
    validate_key(&key)?;
    Ok(Self {
      key,
      value,
      observed_at: Utc::now(),
      flavor,
    })
  }

  /// A value read from (or believed to reflect) the backing store.
  pub fn confirmed(key: &str, value: impl Into<String>) -> Result<Self, PropertyError> {
    Self::new(key, value.into(), RecordFlavor::Confirmed { known_absent: false })
  }

  /// Placeholder for a key known to be absent from the backing store.
  pub fn absent(key: &str) -> Result<Self, PropertyError> {
    Self::new(key, String::new(), RecordFlavor::Confirmed { known_absent: true })
  }

  /// A buffered local write awaiting flush.
  pub fn pending(key: &str, value: impl Into<String>, suppress_notify: bool) -> Result<Self, PropertyError> {
    Self::new(key, value.into(), RecordFlavor::Pending { suppress_notify })
  }

  /// Overrides the observation time. Mostly useful in tests and conflict
  /// scenarios where arrival order differs from production order.
  pub fn observed(mut self, at: DateTime<Utc>) -> Self {
    self.observed_at = at;
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn value(&self) -> &str {
    &self.value
  }

  pub fn observed_at(&self) -> DateTime<Utc> {
    self.observed_at
  }

  pub fn flavor(&self) -> RecordFlavor {
    self.flavor
  }

  pub fn is_pending(&self) -> bool {
    matches!(self.flavor, RecordFlavor::Pending { .. })
  }

  pub fn known_absent(&self) -> bool {
    matches!(self.flavor, RecordFlavor::Confirmed { known_absent: true })
  }

  /// Whether change notifications are suppressed for this write.
  pub fn suppress_notify(&self) -> bool {
    matches!(self.flavor, RecordFlavor::Pending { suppress_notify: true })
  }

  /// Same key, value and time, confirmed flavor. Applied after a durable
  /// write so the record is not flushed again.
  pub fn into_confirmed(mut self) -> Self {
    self.mark_confirmed();
    self
  }

  pub(crate) fn mark_confirmed(&mut self) {
    self.flavor = RecordFlavor::Confirmed { known_absent: false };
  }

  pub(crate) fn advance_observed_at(&mut self, at: DateTime<Utc>) {
    if at > self.observed_at {
      self.observed_at = at;
    }
  }
}

// Identity is the canonical key alone; the concurrent map shards by this hash.
impl PartialEq for PropertyRecord {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
  }
}

impl Eq for PropertyRecord {}

impl Hash for PropertyRecord {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.key.hash(state);
  }
}
