//! Writes followed by invalidation of the resources they affect.

use std::future::Future;
use tracing::{info, warn};

use super::entry::ErrorInfo;
use super::invalidation::InvalidationEngine;
use super::key::QueryKey;
use crate::error::{SyncError, SyncResult};

/// Runs a write and, on success, invalidates the declared prefixes in order.
///
/// Overlapping prefixes are invalidated together, so each observed entry
/// is refetched once.
///
/// There is no transaction: reads converge once the invalidation-triggered
/// refetches land.
#[derive(Clone)]
pub struct MutationCoordinator {
  invalidation: InvalidationEngine,
}

impl MutationCoordinator {
  pub(crate) fn new(invalidation: InvalidationEngine) -> Self {
    Self { invalidation }
  }

  pub async fn mutate<R, W, Fut>(&self, write: W, affected: &[QueryKey]) -> SyncResult<R>
  where
    W: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<R>>,
  {
    self.mutate_with(write, |_| affected.to_vec()).await
  }

  /// Like [`mutate`](Self::mutate), with prefixes derived from the write's result.
  pub async fn mutate_with<R, W, Fut, P>(&self, write: W, affected: P) -> SyncResult<R>
  where
    W: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<R>>,
    P: FnOnce(&R) -> Vec<QueryKey>,
  {
    match write().await {
      Ok(result) => {
        let prefixes = affected(&result);
        let invalidated = self.invalidation.invalidate_all(&prefixes).len();
        info!(
          prefixes = prefixes.len(),
          invalidated, "Write succeeded; invalidated affected queries"
        );
        Ok(result)
      }
      Err(report) => {
        let error = ErrorInfo::from_report(&report);
        warn!(error = %error, "Write failed; nothing invalidated");
        Err(SyncError::Write { error })
      }
    }
  }
}
