//! Read/write facade over the cache, flush engine and backing store
//!
//! Reads hit the cache first and fall back to the store on a miss; writes
//! buffer as pending records and become durable on the next flush cycle.
//! Notification handlers keep this node coherent with remote peers sharing
//! the same backing store.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::PropertyBackend;
use crate::config::PropertyCacheConfig;
use crate::error::{PropertyError, PropertyResult};
use crate::events::{NotificationBus, PropertyEvent};
use crate::flush::FlushEngine;
use crate::policy::{NeverSkip, UpdatePolicy};
use crate::record::{canonical_key, PropertyRecord};
use crate::store::PropertyCache;

/// Per-call options for [`PropertyProvider::set_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
  /// Do not publish a change notification when this write is flushed. Set
  /// for writes that originated from a remote notification.
  pub suppress_notify: bool,
  /// Flush this record synchronously before returning, so the caller
  /// observes durability. Scoped to the one call; there is no ambient mode.
  pub immediate_flush: bool,
}

pub struct PropertyProvider {
  config: PropertyCacheConfig,
  cache: Arc<PropertyCache>,
  backend: Arc<dyn PropertyBackend>,
  bus: Arc<dyn NotificationBus>,
  policy: Arc<dyn UpdatePolicy>,
  engine: Arc<FlushEngine>,
  // Stamped onto every published event; the listener drops events carrying
  // it, so this node never re-applies its own notifications.
  origin: Uuid,
  shutdown_tx: broadcast::Sender<()>,
}

impl PropertyProvider {
  pub fn new(
    config: PropertyCacheConfig,
    backend: Arc<dyn PropertyBackend>,
    bus: Arc<dyn NotificationBus>,
  ) -> Self {
    Self::with_policy(config, backend, bus, Arc::new(NeverSkip))
  }

  pub fn with_policy(
    config: PropertyCacheConfig,
    backend: Arc<dyn PropertyBackend>,
    bus: Arc<dyn NotificationBus>,
    policy: Arc<dyn UpdatePolicy>,
  ) -> Self {
    let cache = Arc::new(PropertyCache::new());
    let origin = Uuid::new_v4();
    let engine = Arc::new(FlushEngine::new(
      cache.clone(),
      backend.clone(),
      bus.clone(),
      origin,
      config.log_debug,
    ));
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      config,
      cache,
      backend,
      bus,
      policy,
      engine,
      origin,
      shutdown_tx,
    }
  }

  /// Spawns the flush timer and the notification listener.
  pub fn start(self: &Arc<Self>) {
    tokio::spawn(
      self
        .engine
        .clone()
        .run_interval(self.config.flush_interval(), self.shutdown_tx.subscribe()),
    );
    tokio::spawn(
      self
        .clone()
        .run_listener(self.bus.subscribe(), self.shutdown_tx.subscribe()),
    );
  }

  /// Signals the background tasks to stop; the flush task runs one final
  /// best-effort flush on its way out.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(());
  }

  /// Runs one flush cycle right now (no-op when one is already in flight).
  pub async fn flush_now(&self) -> bool {
    self.engine.run_cycle().await
  }

  pub fn cache(&self) -> &PropertyCache {
    &self.cache
  }

  /// Returns the property value, or the empty string when the key is absent
  /// or empty. A transient store failure degrades to the last cached value
  /// (or a cached absence placeholder), never an error.
  pub async fn get(&self, key: &str) -> PropertyResult<String> {
    if key.is_empty() {
      return Ok(String::new());
    }
    Ok(self.get_record(key).await?.value().to_string())
  }

  async fn get_record(&self, key: &str) -> PropertyResult<PropertyRecord> {
    let canonical = canonical_key(key);
    let chars = canonical.chars().count();
    if chars > crate::record::MAX_KEY_CHARS {
      return Err(PropertyError::KeyTooLong(chars));
    }

    if !self.config.bypass_cache {
      if let Some(record) = self.cache.get(&canonical) {
        return Ok(record);
      }
    }

    let read = self.read_through(&canonical).await?;
    // The conflict-aware upsert respects a concurrent fresher write; the
    // record handed back is whatever is now resident, not necessarily the
    // row just read.
    Ok(self.cache.upsert(read))
  }

  /// Reads one key from the backing store. A missing row and a failed call
  /// both come back as an absence placeholder; caching the placeholder
  /// bounds retry storms during an outage.
  async fn read_through(&self, canonical: &str) -> PropertyResult<PropertyRecord> {
    match self.backend.read_one(canonical).await {
      Ok(Some(value)) => PropertyRecord::confirmed(canonical, value),
      Ok(None) => PropertyRecord::absent(canonical),
      Err(err) => {
        tracing::error!(key = %canonical, error = %err, "backend read failed, treating value as unknown");
        PropertyRecord::absent(canonical)
      }
    }
  }

  /// Buffers a property write. Returns `Ok(false)` when the key is empty or
  /// the update policy decided to skip the write.
  pub async fn set(&self, key: &str, value: &str, suppress_notify: bool) -> PropertyResult<bool> {
    self
      .set_with(
        key,
        value,
        SetOptions {
          suppress_notify,
          immediate_flush: false,
        },
      )
      .await
  }

  pub async fn set_with(&self, key: &str, value: &str, opts: SetOptions) -> PropertyResult<bool> {
    if key.is_empty() {
      return Ok(false);
    }
    let candidate = PropertyRecord::pending(key, value, opts.suppress_notify)?;

    if opts.immediate_flush {
      if let Err(err) = self
        .engine
        .flush_candidates(std::slice::from_ref(&candidate))
        .await
      {
        tracing::error!(key = %candidate.key(), error = %err, "immediate flush failed, write stays buffered");
      }
    }

    // Load the current value (cache or store) before deciding on the write.
    let cached = self.get_record(candidate.key()).await?;
    if self.policy.should_skip(&candidate, Some(&cached)) {
      if self.config.log_debug {
        tracing::debug!(key = %candidate.key(), "update policy skipped write");
      }
      return Ok(false);
    }

    self.cache.upsert(candidate);
    Ok(true)
  }

  /// Deletes a property (or a whole prefix) from the backing store, then
  /// evicts it locally and notifies peers. The cache is left untouched when
  /// the durable delete fails.
  pub async fn remove(&self, key: &str, is_prefix: bool) -> PropertyResult<bool> {
    self.remove_with(key, is_prefix, false).await
  }

  pub async fn remove_with(
    &self,
    key: &str,
    is_prefix: bool,
    suppress_notify: bool,
  ) -> PropertyResult<bool> {
    if key.is_empty() {
      return Ok(false);
    }
    let canonical = canonical_key(key);
    let chars = canonical.chars().count();
    if chars > crate::record::MAX_KEY_CHARS {
      return Err(PropertyError::KeyTooLong(chars));
    }

    if let Err(err) = self.backend.delete(&canonical, is_prefix).await {
      tracing::error!(key = %canonical, is_prefix, error = %err, "backend delete failed, cache left untouched");
      return Ok(false);
    }

    self.evict(&canonical, is_prefix);

    if !suppress_notify {
      self.bus.publish(
        self.origin,
        PropertyEvent::Removed {
          key: canonical,
          is_prefix,
        },
      );
    }
    Ok(true)
  }

  /// Lists the keys of all live properties under `prefix`.
  ///
  /// Served from cache when the prefix index already covers the prefix;
  /// otherwise the matching rows are loaded from the store under the prefix
  /// load lock, the prefix is registered, and the answer is re-read from
  /// cache so writes that raced in during the load are reflected.
  pub async fn list_keys(&self, prefix: &str) -> PropertyResult<Vec<String>> {
    if prefix.is_empty() {
      return Err(PropertyError::EmptyKey);
    }
    let canonical = canonical_key(prefix);
    let chars = canonical.chars().count();
    if chars > crate::record::MAX_KEY_CHARS {
      return Err(PropertyError::KeyTooLong(chars));
    }

    if self.cache.prefix_index().covers(&canonical) {
      return Ok(self.cache.keys_with_prefix(&canonical));
    }

    let _guard = self.cache.prefix_index().load_guard().await;
    // Another task may have finished the same load while this one waited.
    if self.cache.prefix_index().covers(&canonical) {
      return Ok(self.cache.keys_with_prefix(&canonical));
    }

    match self.backend.read_prefix(&canonical).await {
      Ok(rows) => {
        for row in rows {
          match PropertyRecord::confirmed(&row.key, row.value) {
            // Buffered writes may be fresher than the store; conflict rules
            // apply row by row.
            Ok(record) => {
              self.cache.upsert(record);
            }
            Err(err) => {
              tracing::warn!(key = %row.key, error = %err, "skipping malformed store row");
            }
          }
        }
        self.cache.prefix_index().register(&canonical);
      }
      Err(err) => {
        // Completeness unknown: serve the residents but do not register the
        // prefix, so the next call retries the load.
        tracing::error!(prefix = %canonical, error = %err, "prefix load failed, serving cache residents only");
      }
    }

    Ok(self.cache.keys_with_prefix(&canonical))
  }

  fn evict(&self, canonical: &str, is_prefix: bool) {
    if is_prefix {
      self.cache.remove_by_prefix(canonical);
    } else {
      self.cache.remove(canonical);
    }
  }

  /// A peer changed `key` durably. Evicts the stale entry; when the key is
  /// covered by an indexed prefix it is reloaded instead of just dropped, or
  /// the index's completeness claim would break.
  ///
  /// A resident buffered write is spared: evicting it would lose the write
  /// outright, while the conflict rules settle it against the peer's value
  /// once the reload row arrives or the write flushes.
  pub async fn handle_changed(&self, key: &str) {
    if key.is_empty() {
      return;
    }
    let canonical = canonical_key(key);
    self.cache.remove_unless_pending(&canonical);

    if self.cache.prefix_index().covering(&canonical) {
      let _guard = self.cache.prefix_index().load_guard().await;
      match self.read_through(&canonical).await {
        Ok(record) => {
          self.cache.upsert(record);
        }
        Err(err) => {
          tracing::error!(key = %canonical, error = %err, "could not reload changed property");
        }
      }
    }
  }

  /// A peer removed `key` durably; evict locally without re-contacting the
  /// store.
  pub async fn handle_removed(&self, key: &str, is_prefix: bool) {
    if key.is_empty() {
      return;
    }
    self.evict(&canonical_key(key), is_prefix);
  }

  /// Applies the single-key change handler to every key in the batch.
  pub async fn handle_bulk(&self, keys: &[String]) {
    for key in keys {
      self.handle_changed(key).await;
    }
  }

  async fn apply_event(&self, event: PropertyEvent) {
    match event {
      PropertyEvent::Changed { key } => self.handle_changed(&key).await,
      PropertyEvent::ChangedBulk { keys } => self.handle_bulk(&keys).await,
      PropertyEvent::Removed { key, is_prefix } => self.handle_removed(&key, is_prefix).await,
    }
  }

  async fn run_listener(
    self: Arc<Self>,
    mut events: broadcast::Receiver<(Uuid, PropertyEvent)>,
    mut shutdown: broadcast::Receiver<()>,
  ) {
    loop {
      tokio::select! {
        _ = shutdown.recv() => return,
        event = events.recv() => match event {
          // This node's own events describe state the cache already holds;
          // re-applying them would evict freshly confirmed entries and any
          // write buffered since the flush.
          Ok((origin, _)) if origin == self.origin => {}
          Ok((_, event)) => self.apply_event(event).await,
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            // Dropped notifications mean bounded staleness, not corruption;
            // affected keys heal on their next read-through.
            tracing::warn!(missed, "notification listener lagged");
          }
          Err(broadcast::error::RecvError::Closed) => return,
        },
      }
    }
  }
}
