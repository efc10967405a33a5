//! Byte-offset checkpoints per (dataset, file kind).
//!
//! An offset is only logged after the batch it covers has been committed, so
//! a crash replays at most one batch.

use crate::error::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub dataset: String,
    pub kind: String,
}

impl DatasetKey {
    pub fn new(dataset: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset, self.kind)
    }
}

pub trait CheckpointStore: Send + Sync {
    /// Last committed offset, or 0 when the key has never been logged.
    fn get_offset(&self, key: &DatasetKey) -> Result<u64>;

    fn log_offset(&self, key: &DatasetKey, offset: u64) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One lock per dataset key; workers on different keys never contend.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<DatasetKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &DatasetKey) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.locks);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: Mutex<HashMap<DatasetKey, u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_offset(&self, key: &DatasetKey) -> Result<u64> {
        Ok(lock(&self.offsets).get(key).copied().unwrap_or(0))
    }

    fn log_offset(&self, key: &DatasetKey, offset: u64) -> Result<()> {
        lock(&self.offsets).insert(key.clone(), offset);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetRecord {
    dataset: String,
    kind: String,
    offset: u64,
}

/// Checkpoints kept as one small JSON file per key under
/// `dir/<dataset>/<kind>.json`, both components hex-encoded.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: KeyLocks,
}

impl FileCheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: KeyLocks::default(),
        })
    }

    fn path_for(&self, key: &DatasetKey) -> PathBuf {
        self.dir
            .join(encode_component(&key.dataset))
            .join(format!("{}.json", encode_component(&key.kind)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get_offset(&self, key: &DatasetKey) -> Result<u64> {
        let key_lock = self.locks.lock_for(key);
        let _guard = lock(&key_lock);

        let path = self.path_for(key);
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&path)?;
        let record: OffsetRecord = serde_json::from_str(&raw)?;
        Ok(record.offset)
    }

    fn log_offset(&self, key: &DatasetKey, offset: u64) -> Result<()> {
        let key_lock = self.locks.lock_for(key);
        let _guard = lock(&key_lock);

        let record = OffsetRecord {
            dataset: key.dataset.clone(),
            kind: key.kind.clone(),
            offset,
        };
        write_atomic(&self.path_for(key), &serde_json::to_vec(&record)?)?;
        debug!("Logged offset {} for {}", offset, key);
        Ok(())
    }
}

/// Hex-encodes `raw` into a single path component. Distinct keys always
/// map to distinct file names.
pub(crate) fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        // An empty component would collapse into the parent directory.
        return "_".to_string();
    }
    hex::encode(raw.as_bytes())
}

/// Inverse of [`encode_component`]; `None` for names it never produces.
pub(crate) fn decode_component(name: &str) -> Option<String> {
    if name == "_" {
        return Some(String::new());
    }
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok()
}

/// Writes to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
