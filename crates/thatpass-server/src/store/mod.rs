pub mod db;
pub mod memory;
pub mod model;
pub mod retry;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::error::{EngineError, StoreError};

pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::{LinkId, Policy, PolicyError, PolicyInput, SecretRecord, ViewLimit};
pub use retry::RetryPolicy;

/// Result of a conditional view-count write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The stored count moved since it was read. Carries the current value.
    Conflict(u32),
    Missing,
}

/// Keyed storage for secret records.
///
/// Records that have passed a deadline set through [`expire_after`](Self::expire_after)
/// must be reported as absent by every method, whether or not they have been
/// physically removed yet.
pub trait SecretStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::Duplicate`] rather than overwrite.
    fn insert(&self, id: &LinkId, record: &SecretRecord) -> Result<(), StoreError>;

    fn get(&self, id: &LinkId) -> Result<Option<SecretRecord>, StoreError>;

    /// Set the view count to `new` only if it still equals `expected`.
    fn compare_and_swap_views(
        &self,
        id: &LinkId,
        expected: u32,
        new: u32,
    ) -> Result<CasOutcome, StoreError>;

    /// Add one view and return the record as it stands right after this
    /// increment, or `None` if the record is gone.
    ///
    /// The default reads the record and retries a conditional write under `retry`.
    /// Backends with a native atomic increment should override this.
    fn increment_views(
        &self,
        id: &LinkId,
        retry: &RetryPolicy,
    ) -> Result<Option<SecretRecord>, EngineError> {
        retry.run(|| {
            let Some(mut record) = self.get(id)? else {
                return Ok(ControlFlow::Break(None));
            };
            let next = record.view_count.saturating_add(1);
            Ok(
                match self.compare_and_swap_views(id, record.view_count, next)? {
                    CasOutcome::Swapped => {
                        record.view_count = next;
                        ControlFlow::Break(Some(record))
                    }
                    CasOutcome::Missing => ControlFlow::Break(None),
                    CasOutcome::Conflict(_) => ControlFlow::Continue(()),
                },
            )
        })
    }

    /// Remove a record. Returns whether it existed; removing an absent record is not an error.
    fn delete(&self, id: &LinkId) -> Result<bool, StoreError>;

    /// Ask the store to drop the record once `ttl` has elapsed. No-op if the record is absent.
    fn expire_after(&self, id: &LinkId, ttl: Duration) -> Result<(), StoreError>;

    /// Physically remove every record past its deadline. Returns the removed ids.
    fn prune_expired(&self) -> Result<Vec<LinkId>, StoreError>;
}

/// Spawn a background Tokio task that calls `prune_expired()` every `interval`.
/// A zero interval is raised to one second.
pub fn spawn_sweep(store: Arc<dyn SecretStore>, interval: Duration) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        warn!("zero sweep interval, sweeping every second instead");
        Duration::from_secs(1)
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            ticker.tick().await;
            let swept = {
                let store = Arc::clone(&store);
                tokio::task::spawn_blocking(move || store.prune_expired()).await
            };
            match swept {
                Ok(Ok(pruned)) if !pruned.is_empty() => {
                    info!(removed = pruned.len(), "swept expired secrets");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "background sweep error"),
                Err(e) => warn!(error = %e, "background sweep task failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn sweep_prunes_on_interval() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let id = LinkId::generate();
        store
            .insert(&id, &SecretRecord::new("s".into(), 1_000, Policy::default()))
            .unwrap();
        store.expire_after(&id, Duration::from_secs(10)).unwrap();
        clock.advance(Duration::from_secs(11));
        assert_eq!(store.len(), 1);

        let handle = spawn_sweep(store.clone(), Duration::from_millis(20));
        for _ in 0..100 {
            if store.len() == 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn zero_interval_sweep_keeps_running() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(0))));
        let handle = spawn_sweep(store, Duration::ZERO);
        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
