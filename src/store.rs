//! Object persistence interface and two stores.
//!
//! Objects are addressed by (year, bucket, id) and stored as opaque bytes;
//! [`ObjectStoreExt`] layers the typed JSON encoding on top.

use crate::checkpoint::{decode_component, encode_component, write_atomic};
use crate::entities::{Entity, EntityKind};
use crate::error::{AggregationError, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Individuals,
    Organizations,
    Candidates,
    Committees,
    CmteTxData,
    CmteFinancials,
    TopOverall,
    YearlyTotals,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Individuals => "individuals",
            Bucket::Organizations => "organizations",
            Bucket::Candidates => "candidates",
            Bucket::Committees => "committees",
            Bucket::CmteTxData => "cmte_tx_data",
            Bucket::CmteFinancials => "cmte_financials",
            Bucket::TopOverall => "top_overall",
            Bucket::YearlyTotals => "yearly_totals",
        }
    }

    pub fn for_kind(kind: EntityKind) -> Bucket {
        match kind {
            EntityKind::Individual => Bucket::Individuals,
            EntityKind::Organization => Bucket::Organizations,
            EntityKind::Candidate => Bucket::Candidates,
            EntityKind::Committee => Bucket::CmteTxData,
        }
    }
}

/// One page of a sequential scan. `next_cursor` is `None` once the bucket
/// is exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<(String, T)>,
    pub next_cursor: Option<String>,
}

pub trait ObjectStore: Send + Sync {
    /// Idempotent by id: a repeated put overwrites.
    fn put_raw(&self, year: &str, bucket: Bucket, id: &str, bytes: Vec<u8>) -> Result<()>;

    fn get_raw(&self, year: &str, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` objects in ascending id order, starting after `cursor`.
    fn scan_raw(
        &self,
        year: &str,
        bucket: Bucket,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    fn put_batch_raw(&self, year: &str, bucket: Bucket, items: &[(String, Vec<u8>)]) -> Result<()> {
        for (id, bytes) in items {
            self.put_raw(year, bucket, id, bytes.clone())?;
        }
        Ok(())
    }
}

pub trait ObjectStoreExt: ObjectStore {
    fn put_object<T: Serialize>(&self, year: &str, bucket: Bucket, id: &str, obj: &T) -> Result<()> {
        self.put_raw(year, bucket, id, serde_json::to_vec(obj)?)
    }

    fn get_object<T: DeserializeOwned>(
        &self,
        year: &str,
        bucket: Bucket,
        id: &str,
    ) -> Result<Option<T>> {
        match self.get_raw(year, bucket, id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn batch_get_sequential<T: DeserializeOwned>(
        &self,
        year: &str,
        bucket: Bucket,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<T>> {
        let raw = self.scan_raw(year, bucket, cursor, limit)?;
        let next_cursor = if limit > 0 && raw.len() == limit {
            raw.last().map(|(id, _)| id.clone())
        } else {
            None
        };
        let items = raw
            .into_iter()
            .map(|(id, bytes)| -> Result<(String, T)> {
                Ok((id, serde_json::from_slice(&bytes)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { items, next_cursor })
    }

    /// Objects found for `ids`; missing ids are simply absent from the map.
    fn batch_get_by_id<T: DeserializeOwned>(
        &self,
        year: &str,
        bucket: Bucket,
        ids: &[String],
    ) -> Result<BTreeMap<String, T>> {
        let mut found = BTreeMap::new();
        for id in ids {
            if let Some(obj) = self.get_object(year, bucket, id)? {
                found.insert(id.clone(), obj);
            }
        }
        Ok(found)
    }

    fn put_entity(&self, year: &str, entity: &Entity) -> Result<()> {
        let bucket = Bucket::for_kind(entity.kind());
        match entity {
            Entity::Individual(e) => self.put_object(year, bucket, &e.id, e),
            Entity::Organization(e) => self.put_object(year, bucket, &e.id, e),
            Entity::Candidate(e) => self.put_object(year, bucket, &e.id, e),
            Entity::Committee(e) => self.put_object(year, bucket, &e.cmte_id, e),
        }
    }

    fn get_entity(&self, year: &str, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let bucket = Bucket::for_kind(kind);
        Ok(match kind {
            EntityKind::Individual => self.get_object(year, bucket, id)?.map(Entity::Individual),
            EntityKind::Organization => {
                self.get_object(year, bucket, id)?.map(Entity::Organization)
            }
            EntityKind::Candidate => self.get_object(year, bucket, id)?.map(Entity::Candidate),
            EntityKind::Committee => self.get_object(year, bucket, id)?.map(Entity::Committee),
        })
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AggregationError::StoreError("store lock poisoned".to_string()))
}

type BucketKey = (String, Bucket);

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<BucketKey, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, year: &str, bucket: Bucket) -> usize {
        lock(&self.objects)
            .map(|objects| {
                objects
                    .get(&(year.to_string(), bucket))
                    .map(|b| b.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

impl ObjectStore for MemoryStore {
    fn put_raw(&self, year: &str, bucket: Bucket, id: &str, bytes: Vec<u8>) -> Result<()> {
        lock(&self.objects)?
            .entry((year.to_string(), bucket))
            .or_default()
            .insert(id.to_string(), bytes);
        Ok(())
    }

    fn get_raw(&self, year: &str, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.objects)?
            .get(&(year.to_string(), bucket))
            .and_then(|b| b.get(id))
            .cloned())
    }

    fn scan_raw(
        &self,
        year: &str,
        bucket: Bucket,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let objects = lock(&self.objects)?;
        let Some(bucket) = objects.get(&(year.to_string(), bucket)) else {
            return Ok(Vec::new());
        };
        Ok(bucket
            .iter()
            .filter(|(id, _)| cursor.map_or(true, |c| id.as_str() > c))
            .take(limit)
            .map(|(id, bytes)| (id.clone(), bytes.clone()))
            .collect())
    }
}

/// Objects as JSON files under `root/<year>/<bucket>/<id>.json`, with the
/// year and id hex-encoded so any id round-trips through a scan.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, year: &str, bucket: Bucket) -> PathBuf {
        self.root.join(encode_component(year)).join(bucket.name())
    }

    fn path_for(&self, year: &str, bucket: Bucket, id: &str) -> PathBuf {
        self.bucket_dir(year, bucket)
            .join(format!("{}.json", encode_component(id)))
    }
}

impl ObjectStore for JsonFileStore {
    fn put_raw(&self, year: &str, bucket: Bucket, id: &str, bytes: Vec<u8>) -> Result<()> {
        write_atomic(&self.path_for(year, bucket, id), &bytes)
    }

    fn get_raw(&self, year: &str, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(year, bucket, id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn scan_raw(
        &self,
        year: &str,
        bucket: Bucket,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.bucket_dir(year, bucket);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(decode_component) {
                Some(id) => ids.push(id),
                None => debug!("Ignoring foreign file {}", path.display()),
            }
        }
        ids.sort();

        ids.into_iter()
            .filter(|id| cursor.map_or(true, |c| id.as_str() > c))
            .take(limit)
            .map(|id| -> Result<(String, Vec<u8>)> {
                let bytes = fs::read(self.path_for(year, bucket, &id))?;
                Ok((id, bytes))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CommitteeLedger, Organization};

    fn exercise(store: &dyn ObjectStore) {
        for id in ["C003", "C001", "C002"] {
            store
                .put_object("2020", Bucket::CmteTxData, id, &CommitteeLedger::new(id))
                .unwrap();
        }
        store
            .put_object("2018", Bucket::CmteTxData, "C999", &CommitteeLedger::new("C999"))
            .unwrap();

        let first: Page<CommitteeLedger> = store
            .batch_get_sequential("2020", Bucket::CmteTxData, None, 2)
            .unwrap();
        let ids: Vec<&str> = first.items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["C001", "C002"]);
        assert_eq!(first.next_cursor.as_deref(), Some("C002"));

        let second: Page<CommitteeLedger> = store
            .batch_get_sequential("2020", Bucket::CmteTxData, first.next_cursor.as_deref(), 2)
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].1.cmte_id, "C003");
        assert!(second.next_cursor.is_none());

        let found: BTreeMap<String, CommitteeLedger> = store
            .batch_get_by_id(
                "2020",
                Bucket::CmteTxData,
                &["C002".to_string(), "C404".to_string()],
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("C002"));
    }

    #[test]
    fn test_memory_store_scan() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_file_store_scan() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&JsonFileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_store_ids_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        for id in ["a/b", "a_b", "a:b"] {
            store.put_object("2020", Bucket::TopOverall, id, &id).unwrap();
        }

        let page: Page<String> = store
            .batch_get_sequential("2020", Bucket::TopOverall, None, 10)
            .unwrap();
        let pairs: Vec<(&str, &str)> = page
            .items
            .iter()
            .map(|(id, value)| (id.as_str(), value.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a/b", "a/b"), ("a:b", "a:b"), ("a_b", "a_b")]);
    }

    #[test]
    fn test_entity_round_trip_by_kind() {
        let store = MemoryStore::new();
        let org = Organization {
            id: "org-1".to_string(),
            name: "ACME INC".to_string(),
            ..Default::default()
        };
        store
            .put_entity("2020", &Entity::Organization(org.clone()))
            .unwrap();

        let loaded = store
            .get_entity("2020", EntityKind::Organization, "org-1")
            .unwrap();
        assert_eq!(loaded, Some(Entity::Organization(org)));
        assert!(store
            .get_entity("2020", EntityKind::Individual, "org-1")
            .unwrap()
            .is_none());
        assert_eq!(store.count("2020", Bucket::Organizations), 1);
    }
}
