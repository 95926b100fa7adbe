//! Registry of observers interested in cache keys.

use std::collections::HashMap;
use std::sync::Arc;

use super::entry::CacheEntry;
use super::key::QueryKey;

/// Callback invoked with a snapshot whenever an observed entry changes.
pub type Listener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Opaque id of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Tracks which listeners observe which key.
#[derive(Default)]
pub struct SubscriberRegistry {
  next_id: u64,
  listeners: HashMap<QueryKey, Vec<(SubscriptionId, Listener)>>,
}

impl SubscriberRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `listener` for `key` and return its id.
  pub fn add(&mut self, key: &QueryKey, listener: Listener) -> SubscriptionId {
    self.next_id += 1;
    let id = SubscriptionId(self.next_id);
    self
      .listeners
      .entry(key.clone())
      .or_default()
      .push((id, listener));
    id
  }

  /// Remove one subscription. Returns false if it was already gone.
  pub fn remove(&mut self, key: &QueryKey, id: SubscriptionId) -> bool {
    let Some(list) = self.listeners.get_mut(key) else {
      return false;
    };
    let before = list.len();
    list.retain(|(sub_id, _)| *sub_id != id);
    let removed = list.len() < before;
    if list.is_empty() {
      self.listeners.remove(key);
    }
    removed
  }

  pub fn count(&self, key: &QueryKey) -> usize {
    self.listeners.get(key).map(Vec::len).unwrap_or(0)
  }

  /// Total number of live subscriptions across all keys.
  pub fn total(&self) -> usize {
    self.listeners.values().map(Vec::len).sum()
  }

  /// Listeners for `key`, cloned so they can be called without holding a lock.
  pub fn listeners(&self, key: &QueryKey) -> Vec<Listener> {
    self
      .listeners
      .get(key)
      .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default()
  }

  pub(crate) fn clear(&mut self) {
    self.listeners.clear();
  }
}
