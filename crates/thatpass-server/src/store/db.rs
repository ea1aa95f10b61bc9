use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use super::model::SecretRecord;
use super::{CasOutcome, LinkId, RetryPolicy, SecretStore};
use crate::clock::Clock;
use crate::error::{EngineError, StoreError};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// Store-level deadlines (last live Unix second), keyed like `SECRETS`.
const EXPIRY: TableDefinition<&str, i64> = TableDefinition::new("expiry");

/// Leading byte of every encoded record, so the layout can change later
/// without misreading old rows.
const RECORD_FORMAT_V1: u8 = 0x01;

macro_rules! unavailable_from {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Unavailable(Box::new(redb::Error::from(e)))
                }
            }
        )*
    };
}

unavailable_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        // Ensure all tables exist so read transactions never miss them.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(EXPIRY)?;
        write_txn.commit()?;

        debug!(path = %path.display(), "opened secret database");
        Ok(Self {
            db: Arc::new(db),
            clock,
        })
    }
}

fn past_deadline(
    expiry: &impl ReadableTable<&'static str, i64>,
    key: &str,
    now: i64,
) -> Result<bool, redb::StorageError> {
    Ok(expiry
        .get(key)?
        .is_some_and(|deadline| now > deadline.value()))
}

impl SecretStore for RedbStore {
    fn insert(&self, id: &LinkId, record: &SecretRecord) -> Result<(), StoreError> {
        let key = id.to_string();
        let bytes = encode(&key, record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(key.as_str())?.is_some() {
                return Err(StoreError::Duplicate(*id));
            }
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(link_id = %id, "stored secret");
        Ok(())
    }

    fn get(&self, id: &LinkId) -> Result<Option<SecretRecord>, StoreError> {
        let key = id.to_string();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let expiry = read_txn.open_table(EXPIRY)?;

        if past_deadline(&expiry, &key, self.clock.now())? {
            return Ok(None);
        }
        match table.get(key.as_str())? {
            None => Ok(None),
            Some(guard) => decode(&key, guard.value()).map(Some),
        }
    }

    fn compare_and_swap_views(
        &self,
        id: &LinkId,
        expected: u32,
        new: u32,
    ) -> Result<CasOutcome, StoreError> {
        let key = id.to_string();
        let now = self.clock.now();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut expiry = write_txn.open_table(EXPIRY)?;

            // Copy the bytes out so the AccessGuard (which borrows `table`)
            // is dropped before any mutation.
            let raw: Option<Vec<u8>> = table.get(key.as_str())?.map(|g| g.value().to_vec());

            match raw {
                None => CasOutcome::Missing,
                Some(_) if past_deadline(&expiry, &key, now)? => {
                    table.remove(key.as_str())?;
                    expiry.remove(key.as_str())?;
                    debug!(link_id = %id, "lazy-evicted expired secret");
                    CasOutcome::Missing
                }
                Some(bytes) => {
                    let mut record = decode(&key, &bytes)?;
                    if record.view_count != expected {
                        CasOutcome::Conflict(record.view_count)
                    } else {
                        record.view_count = new;
                        let updated = encode(&key, &record)?;
                        table.insert(key.as_str(), updated.as_slice())?;
                        CasOutcome::Swapped
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// redb serialises write transactions, so a single read-modify-write
    /// inside one transaction is already atomic and never conflicts.
    fn increment_views(
        &self,
        id: &LinkId,
        _retry: &RetryPolicy,
    ) -> Result<Option<SecretRecord>, EngineError> {
        let key = id.to_string();
        let now = self.clock.now();

        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        let incremented = {
            let mut table = write_txn.open_table(SECRETS).map_err(StoreError::from)?;
            let mut expiry = write_txn.open_table(EXPIRY).map_err(StoreError::from)?;

            let raw: Option<Vec<u8>> = table
                .get(key.as_str())
                .map_err(StoreError::from)?
                .map(|g| g.value().to_vec());

            match raw {
                None => None,
                Some(_) if past_deadline(&expiry, &key, now).map_err(StoreError::from)? => {
                    table.remove(key.as_str()).map_err(StoreError::from)?;
                    expiry.remove(key.as_str()).map_err(StoreError::from)?;
                    debug!(link_id = %id, "lazy-evicted expired secret");
                    None
                }
                Some(bytes) => {
                    let mut record = decode(&key, &bytes)?;
                    record.view_count = record.view_count.saturating_add(1);
                    let updated = encode(&key, &record)?;
                    table
                        .insert(key.as_str(), updated.as_slice())
                        .map_err(StoreError::from)?;
                    Some(record)
                }
            }
        };
        write_txn.commit().map_err(StoreError::from)?;
        Ok(incremented)
    }

    fn delete(&self, id: &LinkId) -> Result<bool, StoreError> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut expiry = write_txn.open_table(EXPIRY)?;
            expiry.remove(key.as_str())?;
            let existed = table.remove(key.as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn expire_after(&self, id: &LinkId, ttl: Duration) -> Result<(), StoreError> {
        let key = id.to_string();
        let deadline = self.clock.now().saturating_add(ttl.as_secs() as i64);

        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(SECRETS)?;
            let mut expiry = write_txn.open_table(EXPIRY)?;
            if table.get(key.as_str())?.is_some() {
                expiry.insert(key.as_str(), deadline)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn prune_expired(&self) -> Result<Vec<LinkId>, StoreError> {
        let now = self.clock.now();

        // Collect expired keys in a read pass first.
        let expired_keys: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let expiry = read_txn.open_table(EXPIRY)?;
            let mut keys = Vec::new();
            for item in expiry.iter()? {
                let (k, deadline) = item?;
                if now > deadline.value() {
                    keys.push(k.value().to_owned());
                }
            }
            keys
        };

        if expired_keys.is_empty() {
            return Ok(vec![]);
        }

        let write_txn = self.db.begin_write()?;
        let mut removed = Vec::with_capacity(expired_keys.len());
        {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut expiry = write_txn.open_table(EXPIRY)?;
            for key in &expired_keys {
                // A concurrent expire_after may have moved the deadline.
                let still_expired = past_deadline(&expiry, key, now)?;
                if !still_expired {
                    continue;
                }
                expiry.remove(key.as_str())?;
                let existed = table.remove(key.as_str())?.is_some();
                if !existed {
                    continue;
                }
                match key.parse::<LinkId>() {
                    Ok(id) => removed.push(id),
                    Err(e) => warn!(key = %key, error = %e, "pruned row with unparseable key"),
                }
            }
        }
        write_txn.commit()?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned expired secrets");
        }
        Ok(removed)
    }
}

/// Encode a record as `[RECORD_FORMAT_V1] + bincode(record)`.
fn encode(key: &str, record: &SecretRecord) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| corrupt(key, e))?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(key: &str, bytes: &[u8]) -> Result<SecretRecord, StoreError> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT_V1, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .map_err(|e| corrupt(key, e))?;
            Ok(record)
        }
        Some((marker, _)) => Err(corrupt(key, format!("unknown record format {marker:#04x}"))),
        None => Err(corrupt(key, "empty record")),
    }
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        link_id: key.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::Policy;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, Arc<ManualClock>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(50_000));
        let store = RedbStore::open(&dir.path().join("test.db"), clock.clone()).unwrap();
        (store, clock, dir)
    }

    fn record(secret: &str) -> SecretRecord {
        SecretRecord::new(secret.into(), 50_000, Policy::default())
    }

    #[test]
    fn insert_get_delete() {
        let (s, _clock, _dir) = make_store();
        let id = LinkId::generate();
        s.insert(&id, &record("hunter2")).unwrap();
        let got = s.get(&id).unwrap().unwrap();
        assert_eq!(got.secret, "hunter2");
        assert_eq!(got.view_count, 0);
        assert!(s.delete(&id).unwrap());
        assert!(s.get(&id).unwrap().is_none());
        assert!(!s.delete(&id).unwrap());
    }

    #[test]
    fn duplicate_insert_keeps_original() {
        let (s, _clock, _dir) = make_store();
        let id = LinkId::generate();
        s.insert(&id, &record("first")).unwrap();
        assert!(matches!(
            s.insert(&id, &record("second")),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(s.get(&id).unwrap().unwrap().secret, "first");
    }

    #[test]
    fn native_increment_and_cas() {
        let (s, _clock, _dir) = make_store();
        let id = LinkId::generate();
        s.insert(&id, &record("v")).unwrap();
        let bumped = s.increment_views(&id, &RetryPolicy::Unbounded).unwrap().unwrap();
        assert_eq!(bumped.view_count, 1);
        assert_eq!(bumped.secret, "v");
        assert_eq!(
            s.compare_and_swap_views(&id, 0, 5).unwrap(),
            CasOutcome::Conflict(1)
        );
        assert_eq!(s.compare_and_swap_views(&id, 1, 2).unwrap(), CasOutcome::Swapped);
        assert_eq!(s.get(&id).unwrap().unwrap().view_count, 2);
        assert!(s
            .increment_views(&LinkId::generate(), &RetryPolicy::Unbounded)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parallel_increments_are_serialised() {
        let (s, _clock, _dir) = make_store();
        let id = LinkId::generate();
        s.insert(&id, &record("v")).unwrap();

        let mut seen: Vec<u32> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..10)
                            .map(|_| {
                                s.increment_views(&id, &RetryPolicy::Unbounded)
                                    .unwrap()
                                    .unwrap()
                                    .view_count
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        seen.sort_unstable();
        assert_eq!(seen, (1..=80).collect::<Vec<u32>>());
    }

    #[test]
    fn deadline_hides_and_prune_removes() {
        let (s, clock, _dir) = make_store();
        let id = LinkId::generate();
        let keep = LinkId::generate();
        s.insert(&id, &record("a")).unwrap();
        s.insert(&keep, &record("b")).unwrap();
        s.expire_after(&id, Duration::from_secs(86_400)).unwrap();

        clock.advance(Duration::from_secs(86_400));
        assert!(s.get(&id).unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(s.get(&id).unwrap().is_none());
        assert!(s
            .increment_views(&id, &RetryPolicy::Unbounded)
            .unwrap()
            .is_none());

        // Already lazily evicted by the increment above.
        assert!(s.prune_expired().unwrap().is_empty());
        assert!(s.get(&keep).unwrap().is_some());
    }

    #[test]
    fn prune_reports_removed_ids() {
        let (s, clock, _dir) = make_store();
        let id = LinkId::generate();
        s.insert(&id, &record("a")).unwrap();
        s.expire_after(&id, Duration::from_secs(10)).unwrap();
        clock.advance(Duration::from_secs(11));
        assert_eq!(s.prune_expired().unwrap(), vec![id]);
        assert!(s.prune_expired().unwrap().is_empty());
        assert!(!s.delete(&id).unwrap());
    }

    #[test]
    fn expire_after_on_absent_record_is_noop() {
        let (s, clock, _dir) = make_store();
        let id = LinkId::generate();
        s.expire_after(&id, Duration::from_secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(s.prune_expired().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        let id = LinkId::generate();
        {
            let s = RedbStore::open(&path, Arc::new(ManualClock::new(0))).unwrap();
            s.insert(&id, &record("persisted")).unwrap();
        }
        let s = RedbStore::open(&path, Arc::new(ManualClock::new(0))).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().secret, "persisted");
    }

    #[test]
    fn decode_rejects_unknown_format() {
        assert!(matches!(
            decode("k", &[0x7f, 0, 0]),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(matches!(decode("k", &[]), Err(StoreError::Corrupt { .. })));
    }
}
