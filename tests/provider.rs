//! Facade integration tests: read-through, write buffering, flush cycles,
//! prefix listing and remote-notification handling against the in-memory
//! backing store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

use propcache::{
  BroadcastBus, MemoryBackend, NotificationBus, PropertyBackend, PropertyCacheConfig,
  PropertyError, PropertyEvent, PropertyProvider, PropertyRecord, SetOptions, UpdatePolicy,
};

fn setup() -> (Arc<MemoryBackend>, Arc<BroadcastBus>, Arc<PropertyProvider>) {
  let backend = Arc::new(MemoryBackend::new());
  let bus = Arc::new(BroadcastBus::default());
  let provider = Arc::new(PropertyProvider::new(
    PropertyCacheConfig::default(),
    backend.clone(),
    bus.clone(),
  ));
  (backend, bus, provider)
}

// =============================================================================
// Read/write path
// =============================================================================

#[tokio::test]
async fn test_set_then_get_served_from_pending_entry() {
  let (backend, _bus, provider) = setup();

  assert!(provider.set("A", "1", false).await.unwrap());
  // The set's read-through was the only store round-trip; the get is served
  // from the buffered entry.
  let reads_after_set = backend.reads();
  assert_eq!(provider.get("a").await.unwrap(), "1");
  assert_eq!(backend.reads(), reads_after_set);

  // Not durable yet.
  assert_eq!(backend.value_of("A"), None);
  assert_eq!(provider.cache().select_pending().len(), 1);
}

#[tokio::test]
async fn test_get_miss_caches_absence() {
  let (backend, _bus, provider) = setup();

  assert_eq!(provider.get("ghost").await.unwrap(), "");
  assert_eq!(provider.get("ghost").await.unwrap(), "");
  // Second get hits the cached placeholder, not the store.
  assert_eq!(backend.reads(), 1);
}

#[tokio::test]
async fn test_get_degrades_to_cache_during_outage() {
  let (backend, _bus, provider) = setup();
  backend.put("A", "durable");

  assert_eq!(provider.get("A").await.unwrap(), "durable");
  backend.set_unavailable(true);
  // Still served from cache, no error for a well-formed request.
  assert_eq!(provider.get("A").await.unwrap(), "durable");
}

#[tokio::test]
async fn test_last_write_wins_on_same_key() {
  let (_backend, _bus, provider) = setup();

  provider.set("K", "v1", false).await.unwrap();
  provider.set("K", "v2", false).await.unwrap();
  assert_eq!(provider.get("K").await.unwrap(), "v2");
}

#[tokio::test]
async fn test_equal_value_rewrite_does_not_resurrect_pending() {
  let (_backend, bus, provider) = setup();
  let mut rx = bus.subscribe();

  provider.set("K", "x", false).await.unwrap();
  provider.flush_now().await;
  assert_eq!(rx.try_recv().unwrap().1, PropertyEvent::Changed { key: "K".into() });

  // Idempotent rewrite: accepted, but the record stays confirmed and the
  // next cycle has nothing to flush or announce.
  assert!(provider.set("K", "x", false).await.unwrap());
  assert!(provider.cache().select_pending().is_empty());
  provider.flush_now().await;
  assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_empty_and_oversized_keys() {
  let (_backend, _bus, provider) = setup();

  assert_eq!(provider.get("").await.unwrap(), "");
  assert!(!provider.set("", "v", false).await.unwrap());
  assert!(!provider.remove("", false).await.unwrap());
  assert!(matches!(provider.list_keys("").await, Err(PropertyError::EmptyKey)));

  let long = "K".repeat(300);
  assert!(matches!(provider.get(&long).await, Err(PropertyError::KeyTooLong(300))));
  assert!(matches!(
    provider.set(&long, "v", false).await,
    Err(PropertyError::KeyTooLong(300))
  ));
  assert!(matches!(
    provider.remove(&long, false).await,
    Err(PropertyError::KeyTooLong(300))
  ));
}

#[tokio::test]
async fn test_bypass_cache_reads_store_every_time() {
  let backend = Arc::new(MemoryBackend::new());
  let bus = Arc::new(BroadcastBus::default());
  let config = PropertyCacheConfig {
    bypass_cache: true,
    ..PropertyCacheConfig::default()
  };
  let provider = PropertyProvider::new(config, backend.clone(), bus);

  backend.put("A", "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");
  assert_eq!(backend.reads(), 2);
}

// =============================================================================
// Flush engine through the facade
// =============================================================================

#[tokio::test]
async fn test_flush_round_trip() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();

  provider.set("A", "1", false).await.unwrap();
  provider.flush_now().await;

  assert_eq!(backend.value_of("A").as_deref(), Some("1"));
  assert_eq!(provider.get("A").await.unwrap(), "1");
  assert!(provider.cache().select_pending().is_empty());
  assert_eq!(rx.try_recv().unwrap().1, PropertyEvent::Changed { key: "A".into() });
  assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_immediate_flush_is_durable_before_return() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();

  let accepted = provider
    .set_with(
      "A",
      "1",
      SetOptions {
        suppress_notify: false,
        immediate_flush: true,
      },
    )
    .await
    .unwrap();

  assert!(accepted);
  assert_eq!(backend.value_of("A").as_deref(), Some("1"));
  // Already confirmed: nothing left for the periodic cycle.
  assert!(provider.cache().select_pending().is_empty());
  assert_eq!(rx.try_recv().unwrap().1, PropertyEvent::Changed { key: "A".into() });

  provider.flush_now().await;
  assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_write_survives_outage_until_next_cycle() {
  let (backend, _bus, provider) = setup();

  provider.set("A", "1", false).await.unwrap();
  backend.set_unavailable(true);
  provider.flush_now().await;
  assert_eq!(provider.cache().select_pending().len(), 1);

  backend.set_unavailable(false);
  provider.flush_now().await;
  assert_eq!(backend.value_of("A").as_deref(), Some("1"));
  assert!(provider.cache().select_pending().is_empty());
}

// =============================================================================
// Update policy
// =============================================================================

struct SkipEverything;

impl UpdatePolicy for SkipEverything {
  fn should_skip(&self, _candidate: &PropertyRecord, _cached: Option<&PropertyRecord>) -> bool {
    true
  }
}

#[tokio::test]
async fn test_policy_skip_reports_false_and_buffers_nothing() {
  let backend = Arc::new(MemoryBackend::new());
  let bus = Arc::new(BroadcastBus::default());
  let provider = PropertyProvider::with_policy(
    PropertyCacheConfig::default(),
    backend.clone(),
    bus,
    Arc::new(SkipEverything),
  );

  assert!(!provider.set("A", "1", false).await.unwrap());
  assert!(provider.cache().select_pending().is_empty());
  provider.flush_now().await;
  assert_eq!(backend.value_of("A"), None);
}

// =============================================================================
// Prefix listing
// =============================================================================

#[tokio::test]
async fn test_list_keys_loads_once_then_serves_from_cache() {
  let (backend, _bus, provider) = setup();
  backend.put("APP_ONE", "1");
  backend.put("APP_TWO", "2");
  backend.put("OTHER", "3");

  let mut keys = provider.list_keys("app_").await.unwrap();
  keys.sort();
  assert_eq!(keys, vec!["APP_ONE".to_string(), "APP_TWO".to_string()]);
  assert_eq!(backend.prefix_reads(), 1);

  // A buffered write that lands after the load shows up without another
  // store scan.
  provider.set("APP_NEW", "9", false).await.unwrap();
  let mut keys = provider.list_keys("APP_").await.unwrap();
  keys.sort();
  assert_eq!(
    keys,
    vec!["APP_NEW".to_string(), "APP_ONE".to_string(), "APP_TWO".to_string()]
  );
  assert_eq!(backend.prefix_reads(), 1);
}

#[tokio::test]
async fn test_list_keys_hides_absence_placeholders() {
  let (backend, _bus, provider) = setup();
  backend.put("APP_ONE", "1");

  // Cache a miss under the same prefix.
  assert_eq!(provider.get("APP_MISSING").await.unwrap(), "");

  let keys = provider.list_keys("APP_").await.unwrap();
  assert_eq!(keys, vec!["APP_ONE".to_string()]);
}

#[tokio::test]
async fn test_list_keys_failure_does_not_register_prefix() {
  let (backend, _bus, provider) = setup();
  backend.put("APP_ONE", "1");

  backend.set_unavailable(true);
  assert!(provider.list_keys("APP_").await.unwrap().is_empty());

  // The load is retried once the store recovers.
  backend.set_unavailable(false);
  assert_eq!(provider.list_keys("APP_").await.unwrap(), vec!["APP_ONE".to_string()]);
  assert_eq!(backend.prefix_reads(), 1);
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn test_remove_deletes_store_then_cache_and_notifies() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();
  backend.put("A", "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");

  assert!(provider.remove("a", false).await.unwrap());
  assert_eq!(backend.value_of("A"), None);
  assert_eq!(provider.get("A").await.unwrap(), "");
  assert_eq!(
    rx.try_recv().unwrap().1,
    PropertyEvent::Removed {
      key: "A".into(),
      is_prefix: false
    }
  );
}

#[tokio::test]
async fn test_remove_fails_closed_when_store_is_down() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();
  backend.put("A", "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");

  backend.set_unavailable(true);
  assert!(!provider.remove("A", false).await.unwrap());
  // Cache untouched, nothing published.
  assert_eq!(provider.get("A").await.unwrap(), "1");
  assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_remove_by_prefix_clears_store_cache_and_index() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();
  backend.put("APP_ONE", "1");
  backend.put("APP_TWO", "2");
  backend.put("OTHER", "3");
  provider.list_keys("APP_").await.unwrap();

  assert!(provider.remove("APP_", true).await.unwrap());
  assert_eq!(
    rx.try_recv().unwrap().1,
    PropertyEvent::Removed {
      key: "APP_".into(),
      is_prefix: true
    }
  );

  assert!(provider.list_keys("APP_").await.unwrap().is_empty());
  assert_eq!(provider.get("APP_ONE").await.unwrap(), "");
  assert_eq!(provider.get("OTHER").await.unwrap(), "3");
}

#[tokio::test]
async fn test_remove_suppressed_skips_notification() {
  let (backend, bus, provider) = setup();
  let mut rx = bus.subscribe();
  backend.put("A", "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");

  assert!(provider.remove_with("A", false, true).await.unwrap());
  // Store and cache are cleared; the bus stays quiet.
  assert_eq!(backend.value_of("A"), None);
  assert_eq!(provider.get("A").await.unwrap(), "");
  assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

// =============================================================================
// Remote notification handling
// =============================================================================

#[tokio::test]
async fn test_remote_change_evicts_uncovered_key() {
  let (backend, _bus, provider) = setup();
  backend.put("A", "old");
  assert_eq!(provider.get("A").await.unwrap(), "old");

  backend.put("A", "new");
  provider.handle_changed("a").await;

  // Not under any indexed prefix: plain eviction, next read goes to the store.
  assert_eq!(provider.get("A").await.unwrap(), "new");
}

#[tokio::test]
async fn test_remote_change_reloads_key_under_indexed_prefix() {
  let (backend, _bus, provider) = setup();
  backend.put("APP_ONE", "old");
  provider.list_keys("APP_").await.unwrap();

  backend.put("APP_ONE", "new");
  provider.handle_changed("APP_ONE").await;

  // The reload already repopulated the cache; the listing stays served from
  // cache and reflects the remote write.
  let reads = backend.reads();
  let prefix_reads = backend.prefix_reads();
  assert_eq!(provider.get("APP_ONE").await.unwrap(), "new");
  assert_eq!(provider.list_keys("APP_").await.unwrap(), vec!["APP_ONE".to_string()]);
  assert_eq!(backend.reads(), reads);
  assert_eq!(backend.prefix_reads(), prefix_reads);
}

#[tokio::test]
async fn test_remote_removal_evicts_without_store_roundtrip() {
  let (backend, _bus, provider) = setup();
  backend.put("A", "1");
  assert_eq!(provider.get("A").await.unwrap(), "1");

  // The peer already deleted the row before it notified us.
  backend.delete("A", false).await.unwrap();

  let reads = backend.reads();
  provider.handle_removed("A", false).await;
  assert_eq!(backend.reads(), reads);
  assert_eq!(provider.get("A").await.unwrap(), "");
}

#[tokio::test]
async fn test_remote_change_spares_racing_pending_write() {
  let (backend, _bus, provider) = setup();
  backend.put("A", "remote");

  provider.set("A", "local", false).await.unwrap();
  provider.handle_changed("A").await;

  // The buffered write survives the invalidation and flushes normally.
  assert_eq!(provider.get("A").await.unwrap(), "local");
  provider.flush_now().await;
  assert_eq!(backend.value_of("A").as_deref(), Some("local"));
}

#[tokio::test]
async fn test_own_flush_notification_does_not_drop_racing_write() {
  let (backend, _bus, provider) = setup();
  provider.start();
  tokio::task::yield_now().await;

  provider.set("A", "v1", false).await.unwrap();
  provider.flush_now().await;
  // Buffered between the flush and the listener seeing the Changed event.
  provider.set("A", "v2", false).await.unwrap();

  // Let the listener drain the event the flush just published.
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }

  assert_eq!(provider.get("A").await.unwrap(), "v2");
  assert_eq!(provider.cache().select_pending().len(), 1);
  provider.flush_now().await;
  assert_eq!(backend.value_of("A").as_deref(), Some("v2"));
  provider.shutdown();
}

#[tokio::test]
async fn test_own_flush_event_leaves_confirmed_entry_cached() {
  let (backend, _bus, provider) = setup();
  provider.start();
  tokio::task::yield_now().await;

  provider.set("A", "1", false).await.unwrap();
  provider.flush_now().await;
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }

  // Served from the confirmed entry, no store round-trip after the flush.
  let reads = backend.reads();
  assert_eq!(provider.get("A").await.unwrap(), "1");
  assert_eq!(backend.reads(), reads);
  provider.shutdown();
}

#[tokio::test]
async fn test_bulk_change_applies_per_key() {
  let (backend, _bus, provider) = setup();
  backend.put("A", "old-a");
  backend.put("B", "old-b");
  provider.get("A").await.unwrap();
  provider.get("B").await.unwrap();

  backend.put("A", "new-a");
  backend.put("B", "new-b");
  provider.handle_bulk(&["A".to_string(), "B".to_string()]).await;

  assert_eq!(provider.get("A").await.unwrap(), "new-a");
  assert_eq!(provider.get("B").await.unwrap(), "new-b");
}

#[tokio::test]
async fn test_listener_applies_bus_events() {
  let (backend, bus, provider) = setup();
  backend.put("A", "old");
  assert_eq!(provider.get("A").await.unwrap(), "old");
  provider.start();
  tokio::task::yield_now().await;

  backend.put("A", "new");
  // A different origin id stands in for a remote peer.
  bus.publish(Uuid::new_v4(), PropertyEvent::Changed { key: "A".into() });

  for _ in 0..100 {
    if provider.get("A").await.unwrap() == "new" {
      provider.shutdown();
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("listener never applied the change event");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_interval_timer_flushes_periodically() {
  let (backend, _bus, provider) = setup();
  provider.start();

  provider.set("A", "1", false).await.unwrap();
  assert_eq!(backend.value_of("A"), None);

  // Default interval is 10s; step past one tick.
  tokio::time::sleep(Duration::from_secs(11)).await;
  assert_eq!(backend.value_of("A").as_deref(), Some("1"));
  provider.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_final_flush() {
  let (backend, _bus, provider) = setup();
  provider.start();

  provider.set("A", "1", false).await.unwrap();
  provider.shutdown();

  for _ in 0..100 {
    if backend.value_of("A").as_deref() == Some("1") {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("shutdown flush never reached the store");
}
