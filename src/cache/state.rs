//! Shared mutable state behind the query client.
//!
//! Everything lives behind one mutex that is only ever held for synchronous
//! bookkeeping, never across an `.await`. Listener callbacks are collected
//! while locked and invoked after the lock is released.

use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::entry::{CacheEntry, Data};
use super::key::QueryKey;
use super::storage::CacheStore;
use super::subscribers::{Listener, SubscriberRegistry};
use crate::config::CacheConfig;
use crate::error::SyncResult;

/// Outcome of a fetch, shareable between every caller that joined it.
pub type PendingFetch = Shared<BoxFuture<'static, SyncResult<Data>>>;

pub(crate) struct InFlight {
  pub generation: u64,
  pub pending: PendingFetch,
}

pub(crate) struct State {
  pub store: CacheStore,
  pub subscribers: SubscriberRegistry,
  /// Exactly the keys whose entry status is `Fetching`
  pub in_flight: HashMap<QueryKey, InFlight>,
  pub closed: bool,
}

pub(crate) struct Inner {
  state: Mutex<State>,
  pub config: CacheConfig,
}

impl Inner {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      state: Mutex::new(State {
        store: CacheStore::new(),
        subscribers: SubscriberRegistry::new(),
        in_flight: HashMap::new(),
        closed: false,
      }),
      config,
    }
  }

  /// Lock the state. A panicking listener cannot leave the store half-written,
  /// so a poisoned lock is recovered rather than propagated.
  pub fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Change notifications gathered under the lock, dispatched after it.
#[derive(Default)]
pub(crate) struct Notifications(Vec<(Vec<Listener>, CacheEntry)>);

impl Notifications {
  /// Snapshot `key` for its current listeners.
  pub fn push(&mut self, state: &State, key: &QueryKey) {
    let listeners = state.subscribers.listeners(key);
    if listeners.is_empty() {
      return;
    }
    if let Some(entry) = state.store.get(key) {
      self.0.push((listeners, entry.clone()));
    }
  }

  pub fn dispatch(self) {
    for (listeners, entry) in self.0 {
      for listener in listeners {
        listener(&entry);
      }
    }
  }
}
