//! Prefix invalidation with eager refetch of observed entries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::coordinator::FetchCoordinator;
use super::entry::FetchFn;
use super::key::QueryKey;
use super::state::{Inner, Notifications};

/// Marks entries stale by key prefix and refetches the ones someone is watching.
#[derive(Clone)]
pub struct InvalidationEngine {
  inner: Arc<Inner>,
  fetches: FetchCoordinator,
}

impl InvalidationEngine {
  pub(crate) fn new(inner: Arc<Inner>, fetches: FetchCoordinator) -> Self {
    Self { inner, fetches }
  }

  /// Invalidate every entry whose key starts with `prefix`.
  ///
  /// All matches are marked stale before any refetch starts, and both happen
  /// under one lock, so no caller can observe a falsely fresh entry in
  /// between. Entries with subscribers get one fetch: a fetch already in
  /// flight is joined and followed by a single refetch once it lands, anything
  /// else starts one now. The rest stay stale until their next request.
  ///
  /// Returns the affected keys.
  pub fn invalidate(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self.invalidate_all(std::slice::from_ref(prefix))
  }

  /// Invalidate several prefixes at once, in order.
  ///
  /// A key matched by more than one prefix is refetched once.
  pub fn invalidate_all(&self, prefixes: &[QueryKey]) -> Vec<QueryKey> {
    let mut notes = Notifications::default();
    let affected = {
      let mut state = self.inner.lock();
      if state.closed {
        return Vec::new();
      }

      let mut affected = BTreeSet::new();
      for prefix in prefixes {
        affected.extend(state.store.invalidate(prefix));
      }

      let mut targets: Vec<(QueryKey, FetchFn, Duration)> = Vec::new();
      for key in &affected {
        notes.push(&state, key);
        let Some(entry) = state.store.get(key) else {
          continue;
        };
        if entry.subscriber_count == 0 {
          continue;
        }
        match &entry.fetcher {
          Some(fetcher) => targets.push((key.clone(), Arc::clone(fetcher), entry.stale_after)),
          None => debug!(key = %key, "Observed entry has no fetcher; leaving it stale"),
        }
      }

      let refetching = targets.len();
      for (key, fetcher, stale_after) in targets {
        // The spawned fetch lands in the store on its own.
        let _ = self
          .fetches
          .ensure_locked(&mut state, &key, fetcher, stale_after, &mut notes);
      }

      info!(
        prefixes = prefixes.len(),
        affected = affected.len(),
        refetching,
        "Invalidated cache entries"
      );
      affected.into_iter().collect()
    };
    notes.dispatch();
    affected
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::{fetcher, CacheEntry};
  use crate::cache::subscribers::Listener;
  use crate::config::CacheConfig;
  use crate::query_key;
  use serde_json::json;
  use crate::cache::state::PendingFetch;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  struct Fixture {
    inner: Arc<Inner>,
    fetches: FetchCoordinator,
    engine: InvalidationEngine,
  }

  fn fixture() -> Fixture {
    let inner = Arc::new(Inner::new(CacheConfig::default()));
    let fetches = FetchCoordinator::new(Arc::clone(&inner));
    let engine = InvalidationEngine::new(Arc::clone(&inner), fetches.clone());
    Fixture {
      inner,
      fetches,
      engine,
    }
  }

  fn counting(calls: &Arc<AtomicUsize>) -> FetchFn {
    let calls = Arc::clone(calls);
    fetcher(move || {
      let calls = Arc::clone(&calls);
      async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) }
    })
  }

  fn observe(inner: &Inner, key: &QueryKey) {
    let mut state = inner.lock();
    let listener: Listener = Arc::new(|_: &CacheEntry| {});
    state.subscribers.add(key, listener);
    let entry = state.store.entry(key, Duration::ZERO);
    entry.subscriber_count += 1;
    entry.unobserved_since = None;
  }

  async fn seed(fx: &Fixture, key: &QueryKey, f: FetchFn) {
    fx.fetches
      .request(key, f, Duration::from_secs(600), |_| true)
      .await
      .expect("seed fetch");
  }

  #[tokio::test]
  async fn test_only_matching_prefix_is_invalidated() {
    let fx = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    for key in [query_key!["a", "b", 1], query_key!["a", "b", 2], query_key!["a", "c"]] {
      seed(&fx, &key, counting(&calls)).await;
    }

    let affected = fx.engine.invalidate(&query_key!["a", "b"]);
    assert_eq!(affected, vec![query_key!["a", "b", 1], query_key!["a", "b", 2]]);

    let state = fx.inner.lock();
    assert!(state.store.get(&query_key!["a", "b", 1]).is_some_and(|e| e.is_stale()));
    assert!(state.store.get(&query_key!["a", "b", 2]).is_some_and(|e| e.is_stale()));
    let untouched = state.store.get(&query_key!["a", "c"]).expect("entry");
    assert!(!untouched.is_invalidated());
    assert!(!untouched.is_stale());
  }

  #[tokio::test]
  async fn test_subscribed_entry_refetches_once() {
    let fx = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["rules", "list", json!({"page": 1})];
    seed(&fx, &key, counting(&calls)).await;
    observe(&fx.inner, &key);

    fx.engine.invalidate(&query_key!["rules", "list"]);
    let pending = {
      let state = fx.inner.lock();
      assert!(state.store.get(&key).is_some_and(|e| e.is_fetching()));
      state.in_flight.get(&key).map(|f| f.pending.clone())
    };
    pending.expect("refetch in flight").await.expect("refetch");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let state = fx.inner.lock();
    let entry = state.store.get(&key).expect("entry");
    assert_eq!(entry.data().cloned(), Some(Arc::new(json!(1))));
    assert!(!entry.is_invalidated());
  }

  #[tokio::test]
  async fn test_unsubscribed_entry_waits_for_next_request() {
    let fx = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["projects", "list"];
    seed(&fx, &key, counting(&calls)).await;

    fx.engine.invalidate(&query_key!["projects"]);
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(fx.inner.lock().in_flight.is_empty());

    let stale_after = Duration::from_secs(600);
    fx.fetches
      .request(&key, counting(&calls), stale_after, |e| e.is_stale())
      .await
      .expect("lazy refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  struct Gated {
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    gate: Arc<Notify>,
  }

  impl Gated {
    fn new() -> Self {
      Self {
        calls: Arc::new(AtomicUsize::new(0)),
        active: Arc::new(AtomicUsize::new(0)),
        max_active: Arc::new(AtomicUsize::new(0)),
        gate: Arc::new(Notify::new()),
      }
    }

    fn fetcher(&self) -> FetchFn {
      let calls = Arc::clone(&self.calls);
      let active = Arc::clone(&self.active);
      let max_active = Arc::clone(&self.max_active);
      let gate = Arc::clone(&self.gate);
      fetcher(move || {
        let calls = Arc::clone(&calls);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        let gate = Arc::clone(&gate);
        async move {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          max_active.fetch_max(now, Ordering::SeqCst);
          gate.notified().await;
          active.fetch_sub(1, Ordering::SeqCst);
          Ok(json!(n))
        }
      })
    }
  }

  fn in_flight(fx: &Fixture, key: &QueryKey) -> Option<(u64, PendingFetch)> {
    fx.inner
      .lock()
      .in_flight
      .get(key)
      .map(|f| (f.generation, f.pending.clone()))
  }

  #[tokio::test]
  async fn test_overlapping_prefixes_refetch_once() {
    let fx = fixture();
    let gated = Gated::new();
    let key = query_key!["rules", "list", 1];
    gated.gate.notify_one();
    seed(&fx, &key, gated.fetcher()).await;
    observe(&fx.inner, &key);

    let affected = fx
      .engine
      .invalidate_all(&[query_key!["rules"], query_key!["rules", "list"]]);
    assert_eq!(affected, vec![key.clone()]);

    let (generation, pending) = in_flight(&fx, &key).expect("refetch in flight");
    assert_eq!(generation, 2);
    gated.gate.notify_one();
    pending.await.expect("refetch");

    assert_eq!(gated.calls.load(Ordering::SeqCst), 2);
    assert!(in_flight(&fx, &key).is_none());
    assert!(!fx.inner.lock().store.get(&key).expect("entry").is_invalidated());
  }

  #[tokio::test]
  async fn test_repeated_invalidation_joins_in_flight_fetch() {
    let fx = fixture();
    let gated = Gated::new();
    let key = query_key!["rules", "list", 1];
    gated.gate.notify_one();
    seed(&fx, &key, gated.fetcher()).await;
    observe(&fx.inner, &key);

    fx.engine.invalidate(&query_key!["rules"]);
    fx.engine.invalidate(&query_key!["rules", "list"]);
    for _ in 0..5 {
      tokio::task::yield_now().await;
    }
    assert_eq!(gated.calls.load(Ordering::SeqCst), 2);

    // The joined fetch began before the second invalidation and lands stale.
    let (generation, pending) = in_flight(&fx, &key).expect("refetch in flight");
    assert_eq!(generation, 2);
    gated.gate.notify_one();
    pending.await.expect("joined fetch");
    assert!(fx.inner.lock().store.get(&key).expect("entry").is_invalidated());

    let (generation, pending) = in_flight(&fx, &key).expect("follow-up in flight");
    assert_eq!(generation, 3);
    gated.gate.notify_one();
    pending.await.expect("follow-up");

    assert_eq!(gated.calls.load(Ordering::SeqCst), 3);
    assert_eq!(gated.max_active.load(Ordering::SeqCst), 1);
    assert!(in_flight(&fx, &key).is_none());
    let state = fx.inner.lock();
    let entry = state.store.get(&key).expect("entry");
    assert!(!entry.is_invalidated());
    assert_eq!(entry.data().cloned(), Some(Arc::new(json!(2))));
  }

  #[tokio::test]
  async fn test_unobserved_fetch_gets_no_follow_up() {
    let fx = fixture();
    let gated = Gated::new();
    let key = query_key!["rules", "list", 1];
    let pending = fx
      .fetches
      .refetch(&key, gated.fetcher(), Duration::from_secs(600))
      .expect("fetch");

    fx.engine.invalidate(&query_key!["rules"]);
    gated.gate.notify_one();
    pending.await.expect("fetch");

    assert!(in_flight(&fx, &key).is_none());
    assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
    assert!(fx.inner.lock().store.get(&key).expect("entry").is_invalidated());
  }

  #[tokio::test]
  async fn test_invalidating_unknown_prefix_is_noop() {
    let fx = fixture();
    assert!(fx.engine.invalidate(&query_key!["nothing"]).is_empty());
  }
}
