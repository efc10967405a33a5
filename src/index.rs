//! Secondary identity index.
//!
//! Keyed first by name, then by a sub-key: the job string (employer and
//! occupation) for people, the zip code for organizations.

use crate::checkpoint::write_atomic;
use crate::error::{AggregationError, Result};
use crate::idhash::new_hash;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub years: BTreeSet<String>,
}

impl IndexEntry {
    pub fn new(id: &str, year: &str) -> Self {
        let mut years = BTreeSet::new();
        years.insert(year.to_string());
        Self {
            id: id.to_string(),
            years,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexSpace {
    Job,
    Zip,
}

impl IndexSpace {
    fn dir_name(&self) -> &'static str {
        match self {
            IndexSpace::Job => "by_job",
            IndexSpace::Zip => "by_zip",
        }
    }
}

pub fn job_key(employer: &str, occupation: &str) -> String {
    format!("{} - {}", employer.trim(), occupation.trim())
}

pub trait IdentityIndex: Send + Sync {
    fn lookup(&self, space: IndexSpace, name: &str, key: &str) -> Result<Option<IndexEntry>>;

    fn record(&self, space: IndexSpace, name: &str, key: &str, id: &str, year: &str) -> Result<()>;

    fn lookup_by_job(
        &self,
        name: &str,
        employer: &str,
        occupation: &str,
    ) -> Result<Option<IndexEntry>> {
        self.lookup(IndexSpace::Job, name, &job_key(employer, occupation))
    }

    fn lookup_by_zip(&self, name: &str, zip: &str) -> Result<Option<IndexEntry>> {
        self.lookup(IndexSpace::Zip, name, zip.trim())
    }

    fn record_job(
        &self,
        name: &str,
        employer: &str,
        occupation: &str,
        id: &str,
        year: &str,
    ) -> Result<()> {
        self.record(IndexSpace::Job, name, &job_key(employer, occupation), id, year)
    }

    fn record_zip(&self, name: &str, zip: &str, id: &str, year: &str) -> Result<()> {
        self.record(IndexSpace::Zip, name, zip.trim(), id, year)
    }
}

/// Merges `id`/`year` into the sub-key map of one name.
fn merge_entry(entries: &mut BTreeMap<String, IndexEntry>, key: &str, id: &str, year: &str) {
    match entries.get_mut(key) {
        Some(existing) => {
            if existing.id != id {
                warn!(
                    "Index key '{}' remapped from {} to {}",
                    key, existing.id, id
                );
                existing.id = id.to_string();
            }
            existing.years.insert(year.to_string());
        }
        None => {
            entries.insert(key.to_string(), IndexEntry::new(id, year));
        }
    }
}

type NameMap = BTreeMap<String, BTreeMap<String, IndexEntry>>;

#[derive(Debug, Default)]
pub struct MemoryIndex {
    spaces: Mutex<BTreeMap<IndexSpace, NameMap>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn spaces(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<IndexSpace, NameMap>>> {
        self.spaces
            .lock()
            .map_err(|_| AggregationError::IndexUnavailable("index lock poisoned".to_string()))
    }
}

impl IdentityIndex for MemoryIndex {
    fn lookup(&self, space: IndexSpace, name: &str, key: &str) -> Result<Option<IndexEntry>> {
        let spaces = self.spaces()?;
        Ok(spaces
            .get(&space)
            .and_then(|names| names.get(name))
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn record(&self, space: IndexSpace, name: &str, key: &str, id: &str, year: &str) -> Result<()> {
        let mut spaces = self.spaces()?;
        let entries = spaces
            .entry(space)
            .or_default()
            .entry(name.to_string())
            .or_default();
        merge_entry(entries, key, id, year);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NameFile {
    name: String,
    entries: BTreeMap<String, IndexEntry>,
}

/// One JSON file per name under `dir/<space>/`, named by a digest of the name.
#[derive(Debug)]
pub struct JsonFileIndex {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileIndex {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for space in [IndexSpace::Job, IndexSpace::Zip] {
            fs::create_dir_all(dir.join(space.dir_name())).map_err(|e| {
                AggregationError::IndexUnavailable(format!("{}: {}", dir.display(), e))
            })?;
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, space: IndexSpace, name: &str) -> PathBuf {
        self.dir
            .join(space.dir_name())
            .join(format!("{}.json", new_hash(name)))
    }

    fn read_name(&self, space: IndexSpace, name: &str) -> Result<Option<NameFile>> {
        let path = self.path_for(space, name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| {
            AggregationError::IndexUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

impl IdentityIndex for JsonFileIndex {
    fn lookup(&self, space: IndexSpace, name: &str, key: &str) -> Result<Option<IndexEntry>> {
        Ok(self
            .read_name(space, name)?
            .and_then(|mut file| file.entries.remove(key)))
    }

    fn record(&self, space: IndexSpace, name: &str, key: &str, id: &str, year: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AggregationError::IndexUnavailable("index lock poisoned".to_string()))?;

        let mut file = self.read_name(space, name)?.unwrap_or_else(|| NameFile {
            name: name.to_string(),
            entries: BTreeMap::new(),
        });
        merge_entry(&mut file.entries, key, id, year);

        let path = self.path_for(space, name);
        write_atomic(&path, &serde_json::to_vec(&file)?).map_err(|e| {
            AggregationError::IndexUnavailable(format!("{}: {}", path.display(), e))
        })
    }
}
