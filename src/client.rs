//! The query client: one explicitly constructed cache per session.
//!
//! `QueryClient` ties the store, the fetch coordinator, the subscriber registry,
//! invalidation and mutations together behind a cheap `Clone` handle. Create
//! one per application session, pass it to whoever needs it, and call
//! [`shutdown`](QueryClient::shutdown) when done.
//!
//! Background work (fetches, garbage collection) is spawned on the current
//! tokio runtime, so the client must be used from within one.

use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{
  CacheEntry, Data, FetchCoordinator, FetchFn, Inner, InvalidationEngine, Listener,
  MutationCoordinator, Notifications, PendingFetch, QueryKey, SubscriptionId,
};
use crate::config::CacheConfig;
use crate::error::{SyncError, SyncResult};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  /// Freshness window for this call, instead of the configured one
  pub stale_after: Option<Duration>,
}

impl QueryOptions {
  pub fn stale_after(stale_after: Duration) -> Self {
    Self {
      stale_after: Some(stale_after),
    }
  }
}

#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
  fetches: FetchCoordinator,
  invalidation: InvalidationEngine,
  mutations: MutationCoordinator,
  gc_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl QueryClient {
  pub fn new(config: CacheConfig) -> Self {
    let inner = Arc::new(Inner::new(config));
    let fetches = FetchCoordinator::new(Arc::clone(&inner));
    let invalidation = InvalidationEngine::new(Arc::clone(&inner), fetches.clone());
    let mutations = MutationCoordinator::new(invalidation.clone());
    Self {
      inner,
      fetches,
      invalidation,
      mutations,
      gc_task: Arc::new(Mutex::new(None)),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  pub fn fetches(&self) -> &FetchCoordinator {
    &self.fetches
  }

  pub fn invalidation(&self) -> &InvalidationEngine {
    &self.invalidation
  }

  pub fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  fn resolve_stale_after(&self, key: &QueryKey, options: &QueryOptions) -> Duration {
    options
      .stale_after
      .unwrap_or_else(|| self.inner.config.stale_after_for(key))
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Return cached data for `key` if fresh, otherwise fetch it with `fetcher`.
  pub async fn fetch(&self, key: &QueryKey, fetcher: FetchFn) -> SyncResult<Data> {
    self.fetch_with(key, fetcher, QueryOptions::default()).await
  }

  pub async fn fetch_with(
    &self,
    key: &QueryKey,
    fetcher: FetchFn,
    options: QueryOptions,
  ) -> SyncResult<Data> {
    let stale_after = self.resolve_stale_after(key, &options);
    self
      .fetches
      .request(key, fetcher, stale_after, move |entry: &CacheEntry| {
        entry.is_stale_for(stale_after, Instant::now())
      })
      .await
  }

  /// Fetch in the background; the result lands in the store and reaches subscribers.
  pub fn prefetch(&self, key: &QueryKey, fetcher: FetchFn, options: QueryOptions) {
    let client = self.clone();
    let key = key.clone();
    tokio::spawn(async move {
      if let Err(e) = client.fetch_with(&key, fetcher, options).await {
        debug!(key = %key, error = %e, "Background fetch failed");
      }
    });
  }

  /// Fetch `key` if needed, using the fetcher recorded by an earlier fetch.
  pub async fn request(&self, key: &QueryKey) -> SyncResult<Data> {
    let fetcher = self.stored_fetcher(key)?;
    self.fetch(key, fetcher).await
  }

  /// Start a new fetch for `key` now, superseding any fetch in flight.
  pub fn refetch(&self, key: &QueryKey) -> SyncResult<PendingFetch> {
    let fetcher = self.stored_fetcher(key)?;
    self.refetch_with(key, fetcher, QueryOptions::default())
  }

  pub fn refetch_with(
    &self,
    key: &QueryKey,
    fetcher: FetchFn,
    options: QueryOptions,
  ) -> SyncResult<PendingFetch> {
    let stale_after = self.resolve_stale_after(key, &options);
    self.fetches.refetch(key, fetcher, stale_after)
  }

  fn stored_fetcher(&self, key: &QueryKey) -> SyncResult<FetchFn> {
    let state = self.inner.lock();
    if state.closed {
      return Err(SyncError::ShutDown);
    }
    state
      .store
      .get(key)
      .and_then(|entry| entry.fetcher.clone())
      .ok_or_else(|| SyncError::NoFetcher { key: key.clone() })
  }

  /// Snapshot of the entry for `key`.
  pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.lock().store.get(key).cloned()
  }

  /// Write `value` into the cache as if it had just been fetched.
  pub fn set_data(&self, key: &QueryKey, value: Value) {
    let mut notes = Notifications::default();
    {
      let mut state = self.inner.lock();
      if state.closed {
        return;
      }
      let stale_after = self.inner.config.stale_after_for(key);
      let fresh = state.store.get(key).is_none();
      state.store.set(key, Arc::new(value));
      if fresh {
        if let Some(entry) = state.store.get_mut(key) {
          entry.stale_after = stale_after;
        }
      }
      notes.push(&state, key);
    }
    notes.dispatch();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.inner.lock().store.keys().cloned().collect();
    keys.sort();
    keys
  }

  // ==========================================================================
  // Subscriptions
  // ==========================================================================

  /// Observe `key`. The listener runs after every change to its entry.
  ///
  /// The subscription ends when the returned handle is dropped or
  /// [`Subscription::unsubscribe`] is called.
  pub fn subscribe<F>(&self, key: &QueryKey, on_change: F) -> Subscription
  where
    F: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(on_change);
    let mut state = self.inner.lock();
    let id = if state.closed {
      None
    } else {
      let id = state.subscribers.add(key, listener);
      let stale_after = self.inner.config.stale_after_for(key);
      let entry = state.store.entry(key, stale_after);
      entry.subscriber_count += 1;
      entry.unobserved_since = None;
      debug!(key = %key, subscribers = entry.subscriber_count, "Subscribed");
      Some(id)
    };
    Subscription {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self.inner.lock().subscribers.count(key)
  }

  /// Live subscriptions across all keys.
  pub fn total_subscriptions(&self) -> usize {
    self.inner.lock().subscribers.total()
  }

  // ==========================================================================
  // Invalidation & writes
  // ==========================================================================

  /// Mark everything under `prefix` stale; observed entries refetch immediately.
  pub fn invalidate(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self.invalidation.invalidate(prefix)
  }

  /// Run `write`, then invalidate `affected` prefixes in order if it succeeded.
  pub async fn mutate<R, W, Fut>(&self, write: W, affected: &[QueryKey]) -> SyncResult<R>
  where
    W: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<R>>,
  {
    self.mutations.mutate(write, affected).await
  }

  pub async fn mutate_with<R, W, Fut, P>(&self, write: W, affected: P) -> SyncResult<R>
  where
    W: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<R>>,
    P: FnOnce(&R) -> Vec<QueryKey>,
  {
    self.mutations.mutate_with(write, affected).await
  }

  // ==========================================================================
  // Eviction & lifecycle
  // ==========================================================================

  /// Drop `key` from the cache unless it is fetching or observed.
  pub fn evict(&self, key: &QueryKey) -> bool {
    self.inner.lock().store.evict(key)
  }

  /// Evict every entry that has been unobserved for longer than `gc_grace`.
  pub fn collect_garbage(&self) -> Vec<QueryKey> {
    collect_garbage(&self.inner)
  }

  /// Run [`collect_garbage`](Self::collect_garbage) every `gc_interval` until shutdown.
  pub fn start_gc(&self) {
    let mut task = self.gc_task.lock().unwrap_or_else(PoisonError::into_inner);
    if task.is_some() {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    let interval = self.inner.config.gc_interval;
    *task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        collect_garbage(&inner);
      }
    }));
  }

  /// Tear the client down: stop garbage collection, drop every entry and
  /// subscription. In-flight fetches finish in the background and are discarded.
  pub fn shutdown(&self) {
    if let Some(task) = self
      .gc_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      task.abort();
    }

    let mut state = self.inner.lock();
    state.closed = true;
    let dropped = state.store.len();
    state.store.clear();
    state.subscribers.clear();
    state.in_flight.clear();
    info!(dropped, "Query client shut down");
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.lock().closed
  }
}

fn collect_garbage(inner: &Inner) -> Vec<QueryKey> {
  let mut state = inner.lock();
  let evicted = state
    .store
    .evict_expired(inner.config.gc_grace, Instant::now());
  if !evicted.is_empty() {
    info!(evicted = evicted.len(), "Evicted unobserved cache entries");
  }
  evicted
}

/// Handle to one subscription. Dropping it unsubscribes.
pub struct Subscription {
  inner: Arc<Inner>,
  key: QueryKey,
  id: Option<SubscriptionId>,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn is_active(&self) -> bool {
    self.id.is_some()
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    let Some(id) = self.id.take() else {
      return;
    };
    let mut state = self.inner.lock();
    if !state.subscribers.remove(&self.key, id) {
      return;
    }
    if let Some(entry) = state.store.get_mut(&self.key) {
      entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
      if entry.subscriber_count == 0 {
        entry.unobserved_since = Some(Instant::now());
      }
      debug!(key = %self.key, subscribers = entry.subscriber_count, "Unsubscribed");
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key.to_string())
      .field("active", &self.id.is_some())
      .finish()
  }
}
