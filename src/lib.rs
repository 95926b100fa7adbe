//! Client-side query cache for a REST backend.
//!
//! Reads are keyed by hierarchical [`QueryKey`]s, concurrent requests for the
//! same key share one fetch, and writes invalidate key prefixes so that
//! observed queries refetch while unobserved ones wait for their next read.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;

pub use cache::{fetcher, CacheEntry, FetchStatus, QueryKey, Segment};
pub use client::{QueryClient, QueryOptions, Subscription};
pub use config::{CacheConfig, Config};
pub use error::{SyncError, SyncResult};
pub use query::{Query, QueryState};
