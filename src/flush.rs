//! Periodic write-behind flush engine
//!
//! Pulls pending records from the cache on a timer, submits them to the
//! backing store in one session, promotes successes to confirmed and
//! publishes change notifications. At most one flush runs at a time; a tick
//! that fires mid-flush is dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backend::{PropertyBackend, PropertyRow};
use crate::error::BackendResult;
use crate::events::{NotificationBus, PropertyEvent};
use crate::record::PropertyRecord;
use crate::store::PropertyCache;

// Clears the in-flight flag on every exit path, including an unwind out of
// a third-party backend implementation.
struct FlushLatch<'a>(&'a AtomicBool);

impl Drop for FlushLatch<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct FlushEngine {
  cache: Arc<PropertyCache>,
  backend: Arc<dyn PropertyBackend>,
  bus: Arc<dyn NotificationBus>,
  origin: Uuid,
  flushing: AtomicBool,
  log_debug: bool,
}

impl FlushEngine {
  pub fn new(
    cache: Arc<PropertyCache>,
    backend: Arc<dyn PropertyBackend>,
    bus: Arc<dyn NotificationBus>,
    origin: Uuid,
    log_debug: bool,
  ) -> Self {
    Self {
      cache,
      backend,
      bus,
      origin,
      flushing: AtomicBool::new(false),
      log_debug,
    }
  }

  /// Runs one flush cycle, unless the previous one is still in flight.
  /// Returns whether a cycle actually ran. Never propagates an error: this
  /// is called from the timer task, where an escaped failure would kill the
  /// loop.
  pub async fn run_cycle(&self) -> bool {
    if self
      .flushing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      if self.log_debug {
        tracing::debug!("previous flush cycle still running, tick dropped");
      }
      return false;
    }

    let _latch = FlushLatch(&self.flushing);

    if let Err(err) = self.flush_pending().await {
      tracing::error!(error = %err, "flush cycle failed, records stay pending");
    }
    true
  }

  async fn flush_pending(&self) -> BackendResult<()> {
    let candidates = self.cache.select_pending();
    if candidates.is_empty() {
      if self.log_debug {
        tracing::debug!("no update candidates, skipping flush");
      }
      return Ok(());
    }

    if self.log_debug {
      tracing::debug!(count = candidates.len(), "flushing update candidates");
    }
    self.flush_candidates(&candidates).await
  }

  /// Submits `candidates` in one backing-store session, promotes successful
  /// rows to confirmed and publishes a single change notification covering
  /// them. Also used directly by the facade's immediate-flush path.
  ///
  /// An `Err` means the session could not be established; every candidate
  /// then stays pending for the next cycle.
  pub(crate) async fn flush_candidates(&self, candidates: &[PropertyRecord]) -> BackendResult<()> {
    let rows: Vec<PropertyRow> = candidates
      .iter()
      .map(|r| PropertyRow::new(r.key(), r.value()))
      .collect();

    let outcomes = self.backend.upsert_batch(&rows).await?;

    let mut notify = Vec::new();
    for (record, submitted) in candidates.iter().zip(outcomes) {
      if !submitted {
        tracing::warn!(key = %record.key(), "upsert failed, record stays pending");
        continue;
      }
      if self.log_debug {
        tracing::debug!(key = %record.key(), "record flushed");
      }
      self.cache.promote(record);
      if !record.suppress_notify() {
        notify.push(record.key().to_string());
      }
    }

    // One event per cycle: single-key for one change, bulk for many.
    match notify.len() {
      0 => {}
      1 => self.bus.publish(
        self.origin,
        PropertyEvent::Changed {
          key: notify.into_iter().next().unwrap_or_default(),
        },
      ),
      _ => self
        .bus
        .publish(self.origin, PropertyEvent::ChangedBulk { keys: notify }),
    }
    Ok(())
  }

  /// Timer loop: one flush attempt per interval, plus a best-effort final
  /// flush when the shutdown signal arrives. The first tick fires one full
  /// interval after startup.
  pub async fn run_interval(
    self: Arc<Self>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
  ) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.run_cycle().await;
        }
        _ = shutdown.recv() => {
          tracing::info!("shutdown signal received, running final flush");
          self.run_cycle().await;
          return;
        }
      }
    }
  }
}
