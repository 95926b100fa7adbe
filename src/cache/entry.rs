//! Cache entries and the values that flow through them.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::key::QueryKey;

/// Cached payload. Shared so that snapshots and waiters never copy the JSON tree.
pub type Data = Arc<Value>;

/// Future returned by a transport fetch.
pub type FetchFuture = BoxFuture<'static, color_eyre::Result<Value>>;

/// Factory that produces a fresh fetch future each time it is called.
///
/// The factory is kept alongside the entry so invalidation can refetch
/// without the original caller being present.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap an async closure into a [`FetchFn`].
pub fn fetcher<F, Fut>(f: F) -> FetchFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = color_eyre::Result<Value>> + Send + 'static,
{
  Arc::new(move || -> FetchFuture { Box::pin(f()) })
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
  /// Known key, never fetched
  #[default]
  Idle,
  /// A fetch is in flight
  Fetching,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed; previous data (if any) is kept
  Error,
}

/// A recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
  pub message: String,
  pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      occurred_at: Utc::now(),
    }
  }

  /// Capture an eyre report, including its cause chain.
  pub fn from_report(report: &color_eyre::Report) -> Self {
    Self::new(format!("{:#}", report))
  }
}

impl fmt::Display for ErrorInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

/// One cached resource.
///
/// Entries are owned by the [`CacheStore`](super::CacheStore); callers only
/// ever see clones taken at a point in time.
#[derive(Clone)]
pub struct CacheEntry {
  pub(crate) key: QueryKey,
  pub(crate) data: Option<Data>,
  pub(crate) status: FetchStatus,
  pub(crate) error: Option<ErrorInfo>,
  pub(crate) fetched_at: Option<DateTime<Utc>>,
  pub(crate) fetched_instant: Option<Instant>,
  pub(crate) stale_after: Duration,
  /// Generation of the most recent invalidation, if any is pending
  pub(crate) invalidated_at: Option<u64>,
  pub(crate) subscriber_count: usize,
  pub(crate) generation: u64,
  pub(crate) fetcher: Option<FetchFn>,
  pub(crate) unobserved_since: Option<Instant>,
}

impl CacheEntry {
  pub(crate) fn new(key: QueryKey, stale_after: Duration) -> Self {
    Self {
      key,
      data: None,
      status: FetchStatus::Idle,
      error: None,
      fetched_at: None,
      fetched_instant: None,
      stale_after,
      invalidated_at: None,
      subscriber_count: 0,
      generation: 0,
      fetcher: None,
      unobserved_since: Some(Instant::now()),
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn data(&self) -> Option<&Data> {
    self.data.as_ref()
  }

  pub fn status(&self) -> FetchStatus {
    self.status
  }

  pub fn error(&self) -> Option<&ErrorInfo> {
    self.error.as_ref()
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.fetched_at
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscriber_count
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn is_fetching(&self) -> bool {
    self.status == FetchStatus::Fetching
  }

  /// True if an invalidation is pending for this entry.
  pub fn is_invalidated(&self) -> bool {
    self.invalidated_at.is_some()
  }

  pub fn has_fetcher(&self) -> bool {
    self.fetcher.is_some()
  }

  /// Whether the data should be refetched before being treated as authoritative.
  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now())
  }

  pub fn is_stale_at(&self, now: Instant) -> bool {
    self.is_stale_for(self.stale_after, now)
  }

  /// Staleness under a caller-supplied `stale_after` instead of the entry's own.
  pub fn is_stale_for(&self, stale_after: Duration, now: Instant) -> bool {
    if self.invalidated_at.is_some() {
      return true;
    }
    match self.fetched_instant {
      Some(at) => now.saturating_duration_since(at) >= stale_after,
      None => true,
    }
  }
}

impl fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key.to_string())
      .field("status", &self.status)
      .field("has_data", &self.data.is_some())
      .field("error", &self.error)
      .field("fetched_at", &self.fetched_at)
      .field("stale_after", &self.stale_after)
      .field("invalidated_at", &self.invalidated_at)
      .field("subscriber_count", &self.subscriber_count)
      .field("generation", &self.generation)
      .finish_non_exhaustive()
  }
}
