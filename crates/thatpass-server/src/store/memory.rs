use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use super::{CasOutcome, LinkId, SecretRecord, SecretStore};
use crate::clock::Clock;
use crate::error::StoreError;

struct Slot {
    record: SecretRecord,
    /// Last Unix second at which the record still exists.
    deadline: Option<i64>,
}

impl Slot {
    fn expired(&self, now: i64) -> bool {
        matches!(self.deadline, Some(deadline) if now > deadline)
    }
}

/// In-process store. Locking is per shard, so records on different shards
/// never contend. Uses the optimistic `increment_views` from [`SecretStore`].
pub struct MemoryStore {
    slots: DashMap<LinkId, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Number of physically present records, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run `f` against the live slot for `id`. Expired slots are evicted and yield `None`.
    fn with_live<R>(&self, id: &LinkId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let now = self.clock.now();
        {
            let mut slot = self.slots.get_mut(id)?;
            if !slot.expired(now) {
                return Some(f(&mut slot));
            }
        }
        // The shard guard must be released before removing from the same shard.
        if self.slots.remove_if(id, |_, slot| slot.expired(now)).is_some() {
            debug!(link_id = %id, "lazy-evicted expired secret");
        }
        None
    }
}

impl SecretStore for MemoryStore {
    fn insert(&self, id: &LinkId, record: &SecretRecord) -> Result<(), StoreError> {
        match self.slots.entry(*id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(*id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    record: record.clone(),
                    deadline: None,
                });
                Ok(())
            }
        }
    }

    fn get(&self, id: &LinkId) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.with_live(id, |slot| slot.record.clone()))
    }

    fn compare_and_swap_views(
        &self,
        id: &LinkId,
        expected: u32,
        new: u32,
    ) -> Result<CasOutcome, StoreError> {
        Ok(self
            .with_live(id, |slot| {
                if slot.record.view_count == expected {
                    slot.record.view_count = new;
                    CasOutcome::Swapped
                } else {
                    CasOutcome::Conflict(slot.record.view_count)
                }
            })
            .unwrap_or(CasOutcome::Missing))
    }

    fn delete(&self, id: &LinkId) -> Result<bool, StoreError> {
        Ok(self.slots.remove(id).is_some())
    }

    fn expire_after(&self, id: &LinkId, ttl: Duration) -> Result<(), StoreError> {
        let deadline = self.clock.now().saturating_add(ttl.as_secs() as i64);
        self.with_live(id, |slot| slot.deadline = Some(deadline));
        Ok(())
    }

    fn prune_expired(&self) -> Result<Vec<LinkId>, StoreError> {
        let now = self.clock.now();
        let candidates: Vec<LinkId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().expired(now))
            .map(|entry| *entry.key())
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|id| self.slots.remove_if(id, |_, slot| slot.expired(now)).is_some())
            .collect())
    }
}
