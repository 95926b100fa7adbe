//! Errors surfaced by the synchronization layer.

use thiserror::Error;

use crate::cache::{ErrorInfo, QueryKey};

/// Result type alias for cache operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors returned to callers of the query client.
///
/// `Clone` so a single in-flight fetch can hand the same outcome to every waiter.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
  /// Transport or remote failure while reading
  #[error("Fetch failed for {key}: {error}")]
  Fetch { key: QueryKey, error: ErrorInfo },

  /// Transport or remote failure while writing; nothing was invalidated
  #[error("Write failed: {error}")]
  Write { error: ErrorInfo },

  /// `request`/`refetch` by key alone, for a key that was never fetched
  #[error("No fetcher registered for {key}")]
  NoFetcher { key: QueryKey },

  #[error("Query client has been shut down")]
  ShutDown,
}

impl SyncError {
  /// The recorded failure, if this error carries one.
  pub fn info(&self) -> Option<&ErrorInfo> {
    match self {
      SyncError::Fetch { error, .. } | SyncError::Write { error } => Some(error),
      SyncError::NoFetcher { .. } | SyncError::ShutDown => None,
    }
  }
}
