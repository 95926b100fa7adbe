//! In-memory query cache with request deduplication and prefix invalidation.
//!
//! This module provides a transport-agnostic caching engine that:
//! - Identifies resources by structural [`QueryKey`]s
//! - Keeps at most one fetch in flight per key
//! - Applies responses in fetch-generation order, discarding superseded ones
//! - Invalidates by key prefix and eagerly refetches observed entries
//! - Invalidates affected prefixes after successful writes

mod coordinator;
mod entry;
mod invalidation;
mod key;
mod mutation;
mod state;
mod storage;
mod subscribers;

pub use coordinator::FetchCoordinator;
pub use entry::{fetcher, CacheEntry, Data, ErrorInfo, FetchFn, FetchFuture, FetchStatus};
pub use invalidation::InvalidationEngine;
pub use key::{canonical_json, QueryKey, Segment};
pub use mutation::MutationCoordinator;
pub use state::PendingFetch;
pub use storage::{CacheStore, WriteOutcome};
pub use subscribers::{Listener, SubscriberRegistry, SubscriptionId};

pub(crate) use state::{Inner, Notifications};
