//! Write-behind, time-windowed cache for a relational key/value property store
//!
//! Readers get low-latency cached values; writers accumulate in memory and
//! are flushed to the backing store on a timer, coalescing rapid repeated
//! writes into a single durable upsert. Peers sharing the same backing store
//! stay coherent through change/removal notifications.
//!
//! - Conflict resolution is last-write-wins by wall-clock `observed_at`;
//!   rewrites of an identical value only advance the timestamp.
//! - At most one flush runs at a time; overlapping timer ticks are dropped.
//! - Prefix queries are served from cache once a prefix is fully loaded.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod flush;
pub mod policy;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod prefix;
pub mod provider;
pub mod record;
pub mod store;

pub use backend::{MemoryBackend, PropertyBackend, PropertyRow};
pub use config::PropertyCacheConfig;
pub use error::{BackendError, BackendResult, PropertyError, PropertyResult};
pub use events::{BroadcastBus, NotificationBus, PropertyEvent};
pub use flush::FlushEngine;
pub use policy::{DebounceRenewals, NeverSkip, UpdatePolicy};
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
pub use prefix::PrefixIndex;
pub use provider::{PropertyProvider, SetOptions};
pub use record::{canonical_key, PropertyRecord, RecordFlavor, MAX_KEY_CHARS};
pub use store::PropertyCache;
