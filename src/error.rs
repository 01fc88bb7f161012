//! Error types for the property cache

use thiserror::Error;

use crate::record::MAX_KEY_CHARS;

/// Result type for backing-store operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for facade operations
pub type PropertyResult<T> = Result<T, PropertyError>;

/// Errors raised by a backing store
#[derive(Debug, Error)]
pub enum BackendError {
  /// The store could not be reached (pool exhausted, connection refused, timeout)
  #[error("backing store unavailable: {0}")]
  Unavailable(String),

  /// A statement was rejected by the store
  #[error("backing store query failed: {0}")]
  Query(String),
}

/// Errors surfaced by the provider facade.
///
/// Only programmer errors (invalid arguments) reach callers; transient
/// storage failures degrade to cached values and deferred writes instead.
#[derive(Debug, Error)]
pub enum PropertyError {
  #[error("property key is empty")]
  EmptyKey,

  #[error("property key is {0} characters, the store column allows up to {MAX_KEY_CHARS}")]
  KeyTooLong(usize),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for BackendError {
  fn from(err: tokio_postgres::Error) -> Self {
    BackendError::Query(err.to_string())
  }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for BackendError {
  fn from(err: deadpool_postgres::PoolError) -> Self {
    BackendError::Unavailable(err.to_string())
  }
}
