//! Remote notification events and the in-process bus
//!
//! Peers sharing one backing store stay coherent through these events. The
//! bus contract is at-least-once, fire-and-forget publish, no cross-topic
//! ordering; handlers are idempotent to match. Every publish is stamped with
//! the publishing node's origin id so a listener can tell its own events
//! from a peer's.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A coherency notification exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PropertyEvent {
  /// A single property changed durably.
  Changed { key: String },
  /// One flush cycle changed several properties. Published instead of
  /// per-record events to bound notification volume.
  ChangedBulk { keys: Vec<String> },
  /// A property (or a whole prefix) was removed durably.
  Removed { key: String, is_prefix: bool },
}

/// Transport seam for coherency notifications.
///
/// Implementations bridge to whatever fabric connects the peers (message
/// queue, database event table, ...). [`BroadcastBus`] is the in-process
/// implementation used for tests and single-process deployments.
pub trait NotificationBus: Send + Sync {
  /// Fire-and-forget publish, stamped with the publishing node's id.
  /// Delivery failures are the transport's problem; the cache never blocks
  /// on them.
  fn publish(&self, origin: Uuid, event: PropertyEvent);

  /// Subscribes to published events paired with their origin id.
  fn subscribe(&self) -> broadcast::Receiver<(Uuid, PropertyEvent)>;
}

/// Tokio-broadcast backed bus. Every subscriber sees every published event,
/// including the publisher's own; the origin id is how a listener skips
/// events it caused itself.
pub struct BroadcastBus {
  tx: broadcast::Sender<(Uuid, PropertyEvent)>,
}

impl BroadcastBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }
}

impl Default for BroadcastBus {
  fn default() -> Self {
    Self::new(1024)
  }
}

impl NotificationBus for BroadcastBus {
  fn publish(&self, origin: Uuid, event: PropertyEvent) {
    // No receivers is fine: nobody is listening yet.
    let _ = self.tx.send((origin, event));
  }

  fn subscribe(&self) -> broadcast::Receiver<(Uuid, PropertyEvent)> {
    self.tx.subscribe()
  }
}
