//! Update-suppression policy hook
//!
//! Lets a caller skip redundant writes before they enter the write buffer.
//! The motivating case is high-frequency renewal traffic (session tickets
//! re-written on every request) where most candidates carry no new
//! information and would otherwise force a flush/notify cycle each interval.

use chrono::Duration as ChronoDuration;
use std::time::Duration;

use crate::record::PropertyRecord;

/// Decides whether a write candidate should be dropped instead of buffered.
pub trait UpdatePolicy: Send + Sync {
  /// `cached` is the record currently resident for the candidate's key, if
  /// any. Returning true makes the facade's `set` report `false` without
  /// touching the cache.
  fn should_skip(&self, candidate: &PropertyRecord, cached: Option<&PropertyRecord>) -> bool;
}

/// Default policy: every write is buffered.
pub struct NeverSkip;

impl UpdatePolicy for NeverSkip {
  fn should_skip(&self, _candidate: &PropertyRecord, _cached: Option<&PropertyRecord>) -> bool {
    false
  }
}

/// Coalesces renewal-style rewrites: skips a candidate that is *equivalent*
/// to the cached value (by a caller-supplied predicate) and arrives within
/// `window` of it.
///
/// Textually equal values are not skipped here; the cache's conflict rule
/// already coalesces those by advancing the timestamp in place. This policy
/// targets values that differ only in an embedded renewal timestamp or
/// similar payload noise.
pub struct DebounceRenewals {
  window: ChronoDuration,
  equivalent: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl DebounceRenewals {
  pub fn new<F>(window: Duration, equivalent: F) -> Self
  where
    F: Fn(&str, &str) -> bool + Send + Sync + 'static,
  {
    Self {
      window: ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::MAX),
      equivalent: Box::new(equivalent),
    }
  }
}

impl UpdatePolicy for DebounceRenewals {
  fn should_skip(&self, candidate: &PropertyRecord, cached: Option<&PropertyRecord>) -> bool {
    let Some(cached) = cached else {
      return false;
    };

    // Nothing real cached, or the cached entry is itself an unflushed write:
    // never drop a candidate on top of those.
    if cached.known_absent() || cached.is_pending() {
      return false;
    }

    if candidate.value() == cached.value() {
      return false;
    }

    if !(self.equivalent)(cached.value(), candidate.value()) {
      return false;
    }

    // The cached value is fresher; a renewal would be a step backwards.
    if cached.observed_at() > candidate.observed_at() {
      return true;
    }

    candidate.observed_at() - cached.observed_at() < self.window
  }
}
