//! Cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration surface of the property cache, loaded once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyCacheConfig {
  /// Seconds between flush cycles.
  #[serde(default = "default_flush_interval_secs")]
  pub flush_interval_secs: u64,

  /// Enables chatty per-record flush logging.
  #[serde(default)]
  pub log_debug: bool,

  /// When set, every read goes to the backing store; the cache is still
  /// populated so write buffering keeps working.
  #[serde(default)]
  pub bypass_cache: bool,
}

fn default_flush_interval_secs() -> u64 {
  10
}

impl Default for PropertyCacheConfig {
  fn default() -> Self {
    Self {
      flush_interval_secs: default_flush_interval_secs(),
      log_debug: false,
      bypass_cache: false,
    }
  }
}

impl PropertyCacheConfig {
  pub fn flush_interval(&self) -> Duration {
    // A zero interval would spin the timer task.
    Duration::from_secs(self.flush_interval_secs.max(1))
  }

  pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(source)
  }
}
