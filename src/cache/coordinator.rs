//! Request deduplication.
//!
//! At most one fetch per key is live at a time. Every fetch runs in its own
//! task, so it completes (and lands in the store) even when nobody awaits it.

use color_eyre::eyre::eyre;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Data, ErrorInfo, FetchFn, FetchStatus};
use super::key::QueryKey;
use super::state::{InFlight, Inner, Notifications, PendingFetch, State};
use super::storage::WriteOutcome;
use crate::error::{SyncError, SyncResult};

/// Guarantees a single outstanding request per [`QueryKey`].
#[derive(Clone)]
pub struct FetchCoordinator {
  inner: Arc<Inner>,
}

impl FetchCoordinator {
  pub(crate) fn new(inner: Arc<Inner>) -> Self {
    Self { inner }
  }

  /// Fetch `key` unless a fresh value is cached.
  ///
  /// 1. Fresh `Success` entry: return the cached data, no network call
  /// 2. Fetch already in flight: await that same fetch
  /// 3. Otherwise start a new generation with `fetcher`
  pub async fn request<S>(
    &self,
    key: &QueryKey,
    fetcher: FetchFn,
    stale_after: Duration,
    is_stale: S,
  ) -> SyncResult<Data>
  where
    S: Fn(&CacheEntry) -> bool + Send,
  {
    let mut notes = Notifications::default();
    let pending = {
      let mut state = self.inner.lock();
      if state.closed {
        return Err(SyncError::ShutDown);
      }

      if let Some(entry) = state.store.get(key) {
        if entry.status() == FetchStatus::Success && !is_stale(entry) {
          if let Some(data) = entry.data() {
            debug!(key = %key, "Serving fresh cache entry");
            return Ok(Arc::clone(data));
          }
        }
      }

      self.ensure_locked(&mut state, key, fetcher, stale_after, &mut notes)
    };
    notes.dispatch();
    pending.await
  }

  /// Start a new generation for `key` even if one is already in flight.
  ///
  /// The older fetch keeps running; its response is discarded on arrival.
  pub fn refetch(
    &self,
    key: &QueryKey,
    fetcher: FetchFn,
    stale_after: Duration,
  ) -> SyncResult<PendingFetch> {
    let mut notes = Notifications::default();
    let pending = {
      let mut state = self.inner.lock();
      if state.closed {
        return Err(SyncError::ShutDown);
      }
      self.start_locked(&mut state, key, fetcher, stale_after, &mut notes)
    };
    notes.dispatch();
    Ok(pending)
  }

  pub(crate) fn start_locked(
    &self,
    state: &mut State,
    key: &QueryKey,
    fetcher: FetchFn,
    stale_after: Duration,
    notes: &mut Notifications,
  ) -> PendingFetch {
    start_fetch(&self.inner, state, key, fetcher, stale_after, notes)
  }

  /// Join the fetch in flight for `key`, or start one if there is none.
  ///
  /// A joined fetch that began before an invalidation lands still stale, and
  /// its completion starts the single follow-up fetch.
  pub(crate) fn ensure_locked(
    &self,
    state: &mut State,
    key: &QueryKey,
    fetcher: FetchFn,
    stale_after: Duration,
    notes: &mut Notifications,
  ) -> PendingFetch {
    match state.in_flight.get(key) {
      Some(in_flight) => {
        debug!(key = %key, generation = in_flight.generation, "Joining in-flight fetch");
        in_flight.pending.clone()
      }
      None => self.start_locked(state, key, fetcher, stale_after, notes),
    }
  }
}

fn start_fetch(
  inner: &Arc<Inner>,
  state: &mut State,
  key: &QueryKey,
  fetcher: FetchFn,
  stale_after: Duration,
  notes: &mut Notifications,
) -> PendingFetch {
  let generation = state
    .store
    .begin_fetch(key, Arc::clone(&fetcher), stale_after);

  let (tx, rx) = oneshot::channel();
  let pending: PendingFetch = rx
    .map(|received| received.unwrap_or(Err(SyncError::ShutDown)))
    .boxed()
    .shared();

  if let Some(previous) = state.in_flight.insert(
    key.clone(),
    InFlight {
      generation,
      pending: pending.clone(),
    },
  ) {
    debug!(
      key = %key,
      superseded = previous.generation,
      generation,
      "Superseding in-flight fetch"
    );
  } else {
    debug!(key = %key, generation, "Starting fetch");
  }
  notes.push(state, key);

  let inner = Arc::clone(inner);
  let key = key.clone();
  tokio::spawn(async move {
    let result = AssertUnwindSafe(async move { fetcher().await })
      .catch_unwind()
      .await
      .unwrap_or_else(|_| Err(eyre!("Fetch task panicked")));
    let outcome = complete(&inner, &key, generation, result);
    // Nobody may be waiting; the store is already updated.
    let _ = tx.send(outcome);
  });

  pending
}

/// Land a finished fetch in the store, under the generation rule.
fn complete(
  inner: &Arc<Inner>,
  key: &QueryKey,
  generation: u64,
  result: color_eyre::Result<Value>,
) -> SyncResult<Data> {
  let mut notes = Notifications::default();
  let outcome = {
    let mut state = inner.lock();
    let current = state
      .in_flight
      .get(key)
      .is_some_and(|in_flight| in_flight.generation == generation);
    if current {
      state.in_flight.remove(key);
    }

    let (outcome, write) = match result {
      Ok(value) => {
        let data = Arc::new(value);
        let write = state.store.write_success(key, generation, Arc::clone(&data));
        (Ok(data), write)
      }
      Err(report) => {
        let error = ErrorInfo::from_report(&report);
        warn!(key = %key, generation, error = %error, "Fetch failed");
        let write = state.store.write_error(key, generation, error.clone());
        (
          Err(SyncError::Fetch {
            key: key.clone(),
            error,
          }),
          write,
        )
      }
    };

    if write == WriteOutcome::Applied {
      if let Some(entry) = state.store.get_mut(key) {
        if entry.subscriber_count == 0 {
          entry.unobserved_since = Some(Instant::now());
        }
      }
      notes.push(&state, key);
    }

    // Invalidated while this fetch was running, and still observed
    let follow_up = state.store.get(key).and_then(|entry| {
      let invalidated_since = entry.invalidated_at.is_some_and(|at| at >= generation);
      (current && invalidated_since && entry.subscriber_count > 0)
        .then(|| entry.fetcher.clone().map(|f| (f, entry.stale_after)))
        .flatten()
    });
    if let Some((fetcher, stale_after)) = follow_up {
      debug!(key = %key, generation, "Refetching entry invalidated during fetch");
      let _ = start_fetch(inner, &mut state, key, fetcher, stale_after, &mut notes);
    }
    outcome
  };
  notes.dispatch();
  outcome
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::fetcher;
  use crate::config::CacheConfig;
  use crate::query_key;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  fn coordinator() -> (FetchCoordinator, Arc<Inner>) {
    let inner = Arc::new(Inner::new(CacheConfig::default()));
    (FetchCoordinator::new(Arc::clone(&inner)), inner)
  }

  fn always_stale(_: &CacheEntry) -> bool {
    true
  }

  fn never_stale(_: &CacheEntry) -> bool {
    false
  }

  #[tokio::test]
  async fn test_concurrent_requests_share_one_fetch() {
    let (fetches, _inner) = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let f = {
      let calls = Arc::clone(&calls);
      let gate = Arc::clone(&gate);
      fetcher(move || {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          gate.notified().await;
          Ok(json!("value"))
        }
      })
    };

    let key = query_key!["k"];
    let first = fetches.request(&key, Arc::clone(&f), Duration::ZERO, always_stale);
    let second = fetches.request(&key, Arc::clone(&f), Duration::ZERO, always_stale);
    let release = async {
      tokio::task::yield_now().await;
      gate.notify_one();
    };

    let (a, b, _) = tokio::join!(first, second, release);
    assert_eq!(a.expect("first"), Arc::new(json!("value")));
    assert_eq!(b.expect("second"), Arc::new(json!("value")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_network() {
    let (fetches, _inner) = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let f = {
      let calls = Arc::clone(&calls);
      fetcher(move || {
        let calls = Arc::clone(&calls);
        async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) }
      })
    };

    let key = query_key!["k"];
    fetches
      .request(&key, Arc::clone(&f), Duration::ZERO, always_stale)
      .await
      .expect("first fetch");
    let cached = fetches
      .request(&key, Arc::clone(&f), Duration::ZERO, never_stale)
      .await
      .expect("cached");

    assert_eq!(cached, Arc::new(json!(0)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_status_tracks_in_flight() {
    let (fetches, inner) = coordinator();
    let (tx, rx) = oneshot::channel::<()>();
    let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
    let f = fetcher(move || {
      let rx = Arc::clone(&rx);
      async move {
        if let Some(rx) = rx.lock().await.take() {
          let _ = rx.await;
        }
        Ok(json!(1))
      }
    });

    let key = query_key!["k"];
    let pending = fetches.refetch(&key, f, Duration::ZERO).expect("refetch");
    {
      let state = inner.lock();
      assert_eq!(state.store.get(&key).map(|e| e.status()), Some(FetchStatus::Fetching));
      assert!(state.in_flight.contains_key(&key));
    }

    let _ = tx.send(());
    pending.await.expect("fetch");
    let state = inner.lock();
    assert_eq!(state.store.get(&key).map(|e| e.status()), Some(FetchStatus::Success));
    assert!(!state.in_flight.contains_key(&key));
  }

  #[tokio::test]
  async fn test_late_response_from_older_generation_is_discarded() {
    let (fetches, inner) = coordinator();
    let (slow_tx, slow_rx) = oneshot::channel::<()>();
    let slow_rx = Arc::new(tokio::sync::Mutex::new(Some(slow_rx)));

    let slow = fetcher(move || {
      let slow_rx = Arc::clone(&slow_rx);
      async move {
        if let Some(rx) = slow_rx.lock().await.take() {
          let _ = rx.await;
        }
        Ok(json!("generation 1"))
      }
    });
    let fast = fetcher(|| async { Ok(json!("generation 2")) });

    let key = query_key!["k"];
    let first = fetches.refetch(&key, slow, Duration::ZERO).expect("gen 1");
    let second = fetches.refetch(&key, fast, Duration::ZERO).expect("gen 2");
    second.await.expect("gen 2 result");

    let _ = slow_tx.send(());
    first.await.expect("gen 1 result");

    let state = inner.lock();
    let entry = state.store.get(&key).expect("entry");
    assert_eq!(entry.data().cloned(), Some(Arc::new(json!("generation 2"))));
    assert_eq!(entry.generation(), 2);
    assert_eq!(entry.status(), FetchStatus::Success);
  }

  #[tokio::test]
  async fn test_failure_keeps_previous_data() {
    let (fetches, inner) = coordinator();
    let key = query_key!["k"];
    fetches
      .request(&key, fetcher(|| async { Ok(json!("D")) }), Duration::ZERO, always_stale)
      .await
      .expect("seed");

    let err = fetches
      .request(
        &key,
        fetcher(|| async { Err(eyre!("upstream 503")) }),
        Duration::ZERO,
        always_stale,
      )
      .await
      .expect_err("should fail");
    assert!(matches!(err, SyncError::Fetch { .. }));

    let state = inner.lock();
    let entry = state.store.get(&key).expect("entry");
    assert_eq!(entry.status(), FetchStatus::Error);
    assert_eq!(entry.data().cloned(), Some(Arc::new(json!("D"))));
    assert!(entry.error().is_some_and(|e| e.message.contains("upstream 503")));
  }

  #[tokio::test]
  async fn test_panicking_fetcher_becomes_error() {
    let (fetches, inner) = coordinator();
    let key = query_key!["k"];
    let result = fetches
      .request(
        &key,
        fetcher(|| async { panic!("transport bug") }),
        Duration::ZERO,
        always_stale,
      )
      .await;

    assert!(matches!(result, Err(SyncError::Fetch { .. })));
    let state = inner.lock();
    assert!(!state.in_flight.contains_key(&key));
    assert_eq!(state.store.get(&key).map(|e| e.status()), Some(FetchStatus::Error));
  }
}
