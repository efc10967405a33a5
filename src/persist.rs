//! Batch commit: entities, then index entries, then the checkpoint.
//!
//! Each external write goes through the exponential backoff helper. The
//! checkpoint is advanced last, so a failure anywhere before it leaves the
//! batch to be replayed. Every entity carries its own watermarks, so the
//! replay skips whatever part of the batch did reach the store.

use crate::backoff::ExponentialBackoff;
use crate::checkpoint::{CheckpointStore, DatasetKey};
use crate::entities::Entity;
use crate::error::Result;
use crate::index::IdentityIndex;
use crate::resolver::BatchCache;
use crate::schema::RetryPolicy;
use crate::store::{Bucket, ObjectStore};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub objects: usize,
    pub index_entries: usize,
}

pub struct PersistenceGateway<'a> {
    year: &'a str,
    store: &'a dyn ObjectStore,
    index: &'a dyn IdentityIndex,
    checkpoints: &'a dyn CheckpointStore,
    backoff: ExponentialBackoff,
}

impl<'a> PersistenceGateway<'a> {
    pub fn new(
        year: &'a str,
        store: &'a dyn ObjectStore,
        index: &'a dyn IdentityIndex,
        checkpoints: &'a dyn CheckpointStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            year,
            store,
            index,
            checkpoints,
            backoff: ExponentialBackoff::new(retry),
        }
    }

    pub fn with_sleeper(mut self, sleep: fn(Duration)) -> Self {
        self.backoff = self.backoff.with_sleeper(sleep);
        self
    }

    /// Writes every entity of the batch and any placeholder registrations,
    /// then the deferred index entries.
    pub fn persist_batch(&mut self, cache: &BatchCache) -> Result<CommitSummary> {
        let mut buckets: BTreeMap<Bucket, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for entity in cache.entities() {
            let bytes = match entity {
                Entity::Individual(e) => serde_json::to_vec(e)?,
                Entity::Organization(e) => serde_json::to_vec(e)?,
                Entity::Candidate(e) => serde_json::to_vec(e)?,
                Entity::Committee(e) => serde_json::to_vec(e)?,
            };
            buckets
                .entry(Bucket::for_kind(entity.kind()))
                .or_default()
                .push((entity.id().to_string(), bytes));
        }
        for registration in cache.placeholder_registrations() {
            buckets
                .entry(Bucket::Committees)
                .or_default()
                .push((registration.id.clone(), serde_json::to_vec(registration)?));
        }

        // Filer ledgers first, then counterparties and registrations.
        let mut ordered = Vec::with_capacity(buckets.len());
        if let Some(ledgers) = buckets.remove(&Bucket::CmteTxData) {
            ordered.push((Bucket::CmteTxData, ledgers));
        }
        ordered.extend(buckets);

        let mut summary = CommitSummary::default();
        for (bucket, items) in &ordered {
            self.put_raw_batch(*bucket, items)?;
            summary.objects += items.len();
        }

        for pending in cache.pending_index() {
            let (index, year) = (self.index, self.year);
            self.backoff.retry("index record", || {
                index.record(pending.space, &pending.name, &pending.key, &pending.id, year)
            })?;
            summary.index_entries += 1;
        }

        debug!(
            "Persisted {} objects and {} index entries for {}",
            summary.objects, summary.index_entries, self.year
        );
        Ok(summary)
    }

    pub fn put_objects<T: Serialize>(&mut self, bucket: Bucket, items: &[(String, T)]) -> Result<usize> {
        let encoded = items
            .iter()
            .map(|(id, obj)| -> Result<(String, Vec<u8>)> {
                Ok((id.clone(), serde_json::to_vec(obj)?))
            })
            .collect::<Result<Vec<(String, Vec<u8>)>>>()?;
        self.put_raw_batch(bucket, &encoded)?;
        Ok(encoded.len())
    }

    fn put_raw_batch(&mut self, bucket: Bucket, items: &[(String, Vec<u8>)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let (store, year) = (self.store, self.year);
        self.backoff
            .retry(bucket.name(), || store.put_batch_raw(year, bucket, items))
    }

    /// Records `offset` as committed for `key`.
    pub fn advance(&mut self, key: &DatasetKey, offset: u64) -> Result<()> {
        let checkpoints = self.checkpoints;
        self.backoff
            .retry("checkpoint", || checkpoints.log_offset(key, offset))?;
        info!("Checkpoint {} advanced to {}", key, offset);
        Ok(())
    }

    pub fn commit(&mut self, cache: &BatchCache, key: &DatasetKey, offset: u64) -> Result<CommitSummary> {
        let summary = self.persist_batch(cache)?;
        self.advance(key, offset)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::entities::{CommitteeLedger, EntityKind, Individual};
    use crate::error::AggregationError;
    use crate::index::{IndexSpace, MemoryIndex};
    use crate::store::{MemoryStore, ObjectStoreExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_sleep(_: Duration) {}

    /// Fails the first `failures` batch writes.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl ObjectStore for FlakyStore {
        fn put_raw(&self, year: &str, bucket: Bucket, id: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.put_raw(year, bucket, id, bytes)
        }

        fn get_raw(&self, year: &str, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_raw(year, bucket, id)
        }

        fn scan_raw(
            &self,
            year: &str,
            bucket: Bucket,
            cursor: Option<&str>,
            limit: usize,
        ) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_raw(year, bucket, cursor, limit)
        }

        fn put_batch_raw(&self, year: &str, bucket: Bucket, items: &[(String, Vec<u8>)]) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AggregationError::StoreError("throttled".to_string()));
            }
            self.inner.put_batch_raw(year, bucket, items)
        }
    }

    /// Rejects every write to one bucket.
    struct OutageStore {
        inner: MemoryStore,
        down: Bucket,
    }

    impl ObjectStore for OutageStore {
        fn put_raw(&self, year: &str, bucket: Bucket, id: &str, bytes: Vec<u8>) -> Result<()> {
            if bucket == self.down {
                return Err(AggregationError::StoreError("outage".to_string()));
            }
            self.inner.put_raw(year, bucket, id, bytes)
        }

        fn get_raw(&self, year: &str, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_raw(year, bucket, id)
        }

        fn scan_raw(
            &self,
            year: &str,
            bucket: Bucket,
            cursor: Option<&str>,
            limit: usize,
        ) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_raw(year, bucket, cursor, limit)
        }
    }

    fn sample_cache() -> BatchCache {
        let mut cache = BatchCache::new();
        cache.insert(Entity::Committee(CommitteeLedger::new("C001")), true);
        cache.insert(
            Entity::Individual(Individual {
                id: "indv-1".to_string(),
                ..Default::default()
            }),
            true,
        );
        cache
    }

    #[test]
    fn test_commit_writes_entities_then_checkpoint() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let checkpoints = MemoryCheckpointStore::new();
        let key = DatasetKey::new("2020", "cont");

        let mut gateway =
            PersistenceGateway::new("2020", &store, &index, &checkpoints, RetryPolicy::default());
        let summary = gateway.commit(&sample_cache(), &key, 512).unwrap();

        assert_eq!(summary.objects, 2);
        assert_eq!(checkpoints.get_offset(&key).unwrap(), 512);
        assert!(store
            .get_entity("2020", EntityKind::Committee, "C001")
            .unwrap()
            .is_some());
        assert!(index.lookup(IndexSpace::Job, "x", "y").unwrap().is_none());
    }

    #[test]
    fn test_transient_store_failures_are_retried() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(2),
        };
        let index = MemoryIndex::new();
        let checkpoints = MemoryCheckpointStore::new();
        let key = DatasetKey::new("2020", "cont");

        let mut gateway =
            PersistenceGateway::new("2020", &store, &index, &checkpoints, RetryPolicy::default())
                .with_sleeper(no_sleep);
        gateway.commit(&sample_cache(), &key, 100).unwrap();
        assert_eq!(checkpoints.get_offset(&key).unwrap(), 100);
        assert_eq!(store.inner.count("2020", Bucket::Individuals), 1);
    }

    #[test]
    fn test_exhausted_retries_leave_checkpoint_alone() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(usize::MAX),
        };
        let index = MemoryIndex::new();
        let checkpoints = MemoryCheckpointStore::new();
        let key = DatasetKey::new("2020", "cont");

        let mut gateway = PersistenceGateway::new(
            "2020",
            &store,
            &index,
            &checkpoints,
            RetryPolicy {
                base_ms: 1,
                cap_ms: 10,
            },
        )
        .with_sleeper(no_sleep);
        let result = gateway.commit(&sample_cache(), &key, 100);

        assert!(matches!(
            result,
            Err(AggregationError::MaxRetriesReached { .. })
        ));
        assert_eq!(checkpoints.get_offset(&key).unwrap(), 0);
    }

    #[test]
    fn test_filer_ledgers_are_written_first() {
        let quick = RetryPolicy {
            base_ms: 1,
            cap_ms: 4,
        };
        let key = DatasetKey::new("2020", "cont");

        let store = OutageStore {
            inner: MemoryStore::new(),
            down: Bucket::Individuals,
        };
        let (index, checkpoints) = (MemoryIndex::new(), MemoryCheckpointStore::new());
        let mut gateway = PersistenceGateway::new("2020", &store, &index, &checkpoints, quick)
            .with_sleeper(no_sleep);
        assert!(gateway.commit(&sample_cache(), &key, 100).is_err());
        assert_eq!(store.inner.count("2020", Bucket::CmteTxData), 1);
        assert_eq!(checkpoints.get_offset(&key).unwrap(), 0);

        let store = OutageStore {
            inner: MemoryStore::new(),
            down: Bucket::CmteTxData,
        };
        let (index, checkpoints) = (MemoryIndex::new(), MemoryCheckpointStore::new());
        let mut gateway = PersistenceGateway::new("2020", &store, &index, &checkpoints, quick)
            .with_sleeper(no_sleep);
        assert!(gateway.commit(&sample_cache(), &key, 100).is_err());
        assert_eq!(store.inner.count("2020", Bucket::Individuals), 0);
    }
}
