//! Observer handle for rendering code.
//!
//! Inspired by TanStack Query's `useQuery`, a `Query<T>` binds one consumer to
//! one cache key: it subscribes on mount, decodes the cached JSON into `T`,
//! and reports changes through a non-blocking `poll()` that fits an event loop.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let mut query: Query<Vec<Rule>> = Query::new(&client, key, fetcher(move || {
//!     let api = api.clone();
//!     async move { api.list_rules(&filter).await }
//! }));
//!
//! // Mount: subscribe and fetch if needed
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! let state = query.state();
//! if state.is_loading() { render_spinner() }
//! if let Some(rules) = state.data() { render_rules(rules, state.is_placeholder) }
//! if let Some(e) = state.error() { render_error_badge(e) }
//! ```

use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{CacheEntry, ErrorInfo, FetchFn, FetchStatus, QueryKey};
use crate::client::{QueryClient, QueryOptions, Subscription};

/// What a consumer should render.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub status: FetchStatus,
  pub data: Option<T>,
  pub error: Option<ErrorInfo>,
  pub is_stale: bool,
  /// `data` belongs to the previous key and is shown only to avoid flicker
  pub is_placeholder: bool,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      status: FetchStatus::Idle,
      data: None,
      error: None,
      is_stale: true,
      is_placeholder: false,
    }
  }
}

impl<T> QueryState<T> {
  /// Fetching with nothing to show yet
  pub fn is_loading(&self) -> bool {
    self.status == FetchStatus::Fetching && (self.data.is_none() || self.is_placeholder)
  }

  pub fn is_fetching(&self) -> bool {
    self.status == FetchStatus::Fetching
  }

  pub fn is_success(&self) -> bool {
    self.status == FetchStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == FetchStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_ref().map(|e| e.message.as_str())
  }
}

/// One consumer's view of one cache key.
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  fetcher: FetchFn,
  stale_after: Option<Duration>,
  keep_previous_data: bool,
  refetch_on_subscribe: bool,
  subscription: Option<Subscription>,
  sender: mpsc::UnboundedSender<CacheEntry>,
  receiver: mpsc::UnboundedReceiver<CacheEntry>,
  state: QueryState<T>,
}

impl<T: DeserializeOwned + Clone> Query<T> {
  /// Create an unmounted query. Policies default to the client's configuration.
  pub fn new(client: &QueryClient, key: QueryKey, fetcher: FetchFn) -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      keep_previous_data: client.config().keep_previous_data,
      refetch_on_subscribe: client.config().refetch_on_subscribe,
      client: client.clone(),
      key,
      fetcher,
      stale_after: None,
      subscription: None,
      sender,
      receiver,
      state: QueryState::default(),
    }
  }

  /// Set the stale time for this query.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_after = Some(duration);
    self
  }

  pub fn keep_previous_data(mut self, keep: bool) -> Self {
    self.keep_previous_data = keep;
    self
  }

  pub fn refetch_on_subscribe(mut self, refetch: bool) -> Self {
    self.refetch_on_subscribe = refetch;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  pub fn is_mounted(&self) -> bool {
    self.subscription.is_some()
  }

  fn options(&self) -> QueryOptions {
    QueryOptions {
      stale_after: self.stale_after,
    }
  }

  /// Mount: subscribe to the key and fetch if the cache cannot serve it.
  ///
  /// Missing data is always fetched. Stale data is refetched only when
  /// `refetch_on_subscribe` is set. Calling this on a mounted query is a no-op.
  pub fn fetch(&mut self) {
    if self.subscription.is_some() {
      return;
    }

    let sender = self.sender.clone();
    self.subscription = Some(self.client.subscribe(&self.key, move |entry| {
      // Receiver may have been dropped
      let _ = sender.send(entry.clone());
    }));

    let current = self.client.read(&self.key);
    let stale_after = self
      .stale_after
      .unwrap_or_else(|| self.client.config().stale_after_for(&self.key));
    let should_fetch = match &current {
      Some(entry) if entry.data().is_some() => {
        self.refetch_on_subscribe && entry.is_stale_for(stale_after, Instant::now())
      }
      _ => true,
    };

    if let Some(entry) = &current {
      self.apply(entry);
    }
    if should_fetch {
      self
        .client
        .prefetch(&self.key, self.fetcher.clone(), self.options());
    }
  }

  /// Force a refetch, even if data is fresh or a fetch is already running.
  pub fn refetch(&mut self) {
    if self.subscription.is_none() {
      self.fetch();
    }
    // The fetch lands in the store and arrives via `poll`.
    let _ = self
      .client
      .refetch_with(&self.key, self.fetcher.clone(), self.options());
  }

  /// Switch to a different key, e.g. after a filter change.
  ///
  /// With `keep_previous_data`, the current data stays visible as a
  /// placeholder until the new key has data of its own. The placeholder
  /// never enters the cache.
  pub fn set_key(&mut self, key: QueryKey, fetcher: FetchFn) {
    if key == self.key {
      return;
    }

    let was_mounted = self.subscription.take().is_some();
    let previous = if self.keep_previous_data {
      self.state.data.take()
    } else {
      None
    };

    self.key = key;
    self.fetcher = fetcher;
    self.state = QueryState {
      is_placeholder: previous.is_some(),
      data: previous,
      ..QueryState::default()
    };

    if was_mounted {
      self.fetch();
    }
  }

  /// Unsubscribe without dropping the query.
  pub fn unmount(&mut self) {
    self.subscription = None;
  }

  /// Drain pending change notifications.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut latest = None;
    while let Ok(entry) = self.receiver.try_recv() {
      // Leftovers from a key we already switched away from
      if entry.key() == &self.key {
        latest = Some(entry);
      }
    }

    match latest {
      Some(entry) => {
        self.apply(&entry);
        true
      }
      None => false,
    }
  }

  fn apply(&mut self, entry: &CacheEntry) {
    let decoded = entry
      .data()
      .map(|data| T::deserialize(data.as_ref()).map_err(|e| (entry.key().clone(), e)));

    let (data, decode_error) = match decoded {
      Some(Ok(value)) => (Some(value), None),
      Some(Err((key, e))) => (
        None,
        Some(ErrorInfo::new(format!("Failed to decode {}: {}", key, e))),
      ),
      None => (None, None),
    };

    let is_stale = match self.stale_after {
      Some(stale_after) => entry.is_stale_for(stale_after, Instant::now()),
      None => entry.is_stale(),
    };

    let (data, is_placeholder) = match data {
      Some(value) => (Some(value), false),
      None if self.state.is_placeholder => (self.state.data.take(), true),
      None => (None, false),
    };

    let (status, error) = match decode_error {
      Some(e) => (FetchStatus::Error, Some(e)),
      None => (entry.status(), entry.error().cloned()),
    };

    self.state = QueryState {
      status,
      data,
      error,
      is_stale,
      is_placeholder,
    };
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key.to_string())
      .field("state", &self.state)
      .field("mounted", &self.subscription.is_some())
      .field("stale_after", &self.stale_after)
      .finish_non_exhaustive()
  }
}
