//! In-memory cache store.
//!
//! The store is plain data: it never awaits and never calls back into user
//! code. Generation gating lives here so that every writer goes through it.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, Data, ErrorInfo, FetchFn, FetchStatus};
use super::key::QueryKey;

/// Result of a generation-gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Applied,
  /// The write belonged to a superseded fetch and was dropped
  StaleWriteDiscarded,
}

/// Mapping from [`QueryKey`] to [`CacheEntry`].
#[derive(Debug, Default)]
pub struct CacheStore {
  entries: HashMap<QueryKey, CacheEntry>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub(crate) fn get_mut(&mut self, key: &QueryKey) -> Option<&mut CacheEntry> {
    self.entries.get_mut(key)
  }

  /// Get the entry for `key`, creating an idle one if needed.
  pub(crate) fn entry(&mut self, key: &QueryKey, stale_after: Duration) -> &mut CacheEntry {
    self
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone(), stale_after))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
    self.entries.keys()
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  /// Register a new fetch for `key` and return its generation.
  ///
  /// Sets the entry to `Fetching`. The caller must hold the matching in-flight
  /// record for as long as the status stays `Fetching`.
  pub(crate) fn begin_fetch(
    &mut self,
    key: &QueryKey,
    fetcher: FetchFn,
    stale_after: Duration,
  ) -> u64 {
    let entry = self.entry(key, stale_after);
    entry.generation += 1;
    entry.status = FetchStatus::Fetching;
    entry.stale_after = stale_after;
    entry.fetcher = Some(fetcher);
    entry.generation
  }

  /// Store fetched data for `key`.
  pub fn set(&mut self, key: &QueryKey, data: Data) {
    let generation = self.entries.get(key).map(|e| e.generation).unwrap_or(0);
    let entry = self.entry(key, Duration::ZERO);
    // A manual write during a fetch keeps the in-flight status intact.
    let status = if entry.status == FetchStatus::Fetching {
      FetchStatus::Fetching
    } else {
      FetchStatus::Success
    };
    self.write_success(key, generation, data);
    if let Some(entry) = self.entries.get_mut(key) {
      entry.status = status;
      entry.invalidated_at = None;
    }
  }

  /// Apply a successful fetch result if `generation` is still current.
  pub(crate) fn write_success(&mut self, key: &QueryKey, generation: u64, data: Data) -> WriteOutcome {
    let Some(entry) = self.gate(key, generation) else {
      return WriteOutcome::StaleWriteDiscarded;
    };
    entry.data = Some(data);
    entry.status = FetchStatus::Success;
    entry.error = None;
    entry.fetched_at = Some(Utc::now());
    entry.fetched_instant = Some(Instant::now());
    // Data fetched before an invalidation is still stale.
    if entry.invalidated_at.is_some_and(|at| generation > at) {
      entry.invalidated_at = None;
    }
    WriteOutcome::Applied
  }

  /// Record a fetch failure for `key`.
  ///
  /// Like [`set`](Self::set), a fetch still in flight keeps the status `Fetching`.
  pub fn mark_error(&mut self, key: &QueryKey, error: ErrorInfo) {
    let generation = self.entries.get(key).map(|e| e.generation).unwrap_or(0);
    let fetching = self.entry(key, Duration::ZERO).status == FetchStatus::Fetching;
    self.write_error(key, generation, error);
    if fetching {
      if let Some(entry) = self.entries.get_mut(key) {
        entry.status = FetchStatus::Fetching;
      }
    }
  }

  /// Apply a failed fetch if `generation` is still current. Data is kept.
  pub(crate) fn write_error(
    &mut self,
    key: &QueryKey,
    generation: u64,
    error: ErrorInfo,
  ) -> WriteOutcome {
    let Some(entry) = self.gate(key, generation) else {
      return WriteOutcome::StaleWriteDiscarded;
    };
    entry.status = FetchStatus::Error;
    entry.error = Some(error);
    WriteOutcome::Applied
  }

  fn gate(&mut self, key: &QueryKey, generation: u64) -> Option<&mut CacheEntry> {
    match self.entries.get_mut(key) {
      Some(entry) if generation >= entry.generation => Some(entry),
      Some(entry) => {
        debug!(
          key = %key,
          generation,
          current = entry.generation,
          "Discarding response from superseded fetch"
        );
        None
      }
      None => {
        debug!(key = %key, generation, "Discarding response for evicted entry");
        None
      }
    }
  }

  /// Mark every entry under `prefix` stale and return the affected keys.
  pub fn invalidate(&mut self, prefix: &QueryKey) -> Vec<QueryKey> {
    let mut affected = Vec::new();
    for (key, entry) in self.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.invalidated_at = Some(entry.generation);
        affected.push(key.clone());
      }
    }
    affected.sort();
    affected
  }

  /// Remove `key` unless it is fetching or observed.
  ///
  /// Returns true if an entry was removed.
  pub fn evict(&mut self, key: &QueryKey) -> bool {
    match self.entries.get(key) {
      Some(entry) if entry.is_fetching() || entry.subscriber_count > 0 => false,
      Some(_) => self.entries.remove(key).is_some(),
      None => false,
    }
  }

  /// Evict every unobserved, idle entry that has been unobserved for `grace`.
  pub fn evict_expired(&mut self, grace: Duration, now: Instant) -> Vec<QueryKey> {
    let expired: Vec<QueryKey> = self
      .entries
      .values()
      .filter(|entry| {
        !entry.is_fetching()
          && entry.subscriber_count == 0
          && entry
            .unobserved_since
            .is_some_and(|since| now.saturating_duration_since(since) >= grace)
      })
      .map(|entry| entry.key.clone())
      .collect();

    for key in &expired {
      self.entries.remove(key);
    }
    expired
  }

  pub(crate) fn clear(&mut self) {
    self.entries.clear();
  }
}
