//! Entity resolution for one batch.
//!
//! Lookups go batch cache first, then the secondary index, and only then
//! create a new entity under its identity hash. Everything touched during
//! the batch lives in the [`BatchCache`] until the batch is committed.

use crate::entities::{
    placeholder_committee, Candidate, Committee, CommitteeLedger, Entity, EntityKind, Individual,
    Organization,
};
use crate::error::{AggregationError, Result};
use crate::idhash::{organization_id, person_id};
use crate::index::{job_key, IdentityIndex, IndexSpace};
use crate::store::{Bucket, ObjectStore, ObjectStoreExt};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Identity fields of a party to a transaction.
#[derive(Debug, Clone, Copy)]
pub enum Identity<'r> {
    Person {
        name: &'r str,
        employer: &'r str,
        occupation: &'r str,
        zip: &'r str,
        city: &'r str,
        state: &'r str,
    },
    Organization {
        name: &'r str,
        zip: &'r str,
        city: &'r str,
        state: &'r str,
    },
    Committee(&'r str),
    Candidate(&'r str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: String,
    pub kind: EntityKind,
    pub created: bool,
}

/// Index write deferred until the entities of the batch are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIndexEntry {
    pub space: IndexSpace,
    pub name: String,
    pub key: String,
    pub id: String,
}

/// Working set of one batch. Never shared between workers.
#[derive(Debug, Default)]
pub struct BatchCache {
    persons: BTreeMap<String, BTreeMap<String, String>>,
    organizations: BTreeMap<String, BTreeMap<String, String>>,
    entities: BTreeMap<String, Entity>,
    created: BTreeSet<String>,
    pending_index: Vec<PendingIndexEntry>,
    placeholder_registrations: BTreeMap<String, Committee>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Removes an entity for exclusive mutation; hand it back with [`Self::restore`].
    pub fn take(&mut self, id: &str) -> Result<Entity> {
        self.entities
            .remove(id)
            .ok_or_else(|| AggregationError::MissingEntity(id.to_string()))
    }

    pub fn restore(&mut self, entity: Entity) {
        self.entities.insert(entity.id().to_string(), entity);
    }

    pub fn insert(&mut self, entity: Entity, created: bool) {
        let id = entity.id().to_string();
        if created {
            self.created.insert(id.clone());
        }
        self.entities.insert(id, entity);
    }

    pub fn is_created(&self, id: &str) -> bool {
        self.created.contains(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Marks every cached entity as holding the rows of `input` below `end`.
    pub fn advance_watermarks(&mut self, input: &str, end: u64) {
        for entity in self.entities.values_mut() {
            entity.watermarks_mut().advance(input, end);
        }
    }

    pub fn pending_index(&self) -> &[PendingIndexEntry] {
        &self.pending_index
    }

    pub fn placeholder_registrations(&self) -> impl Iterator<Item = &Committee> {
        self.placeholder_registrations.values()
    }

    fn secondary(&self, space: IndexSpace, name: &str, key: &str) -> Option<&String> {
        let map = match space {
            IndexSpace::Job => &self.persons,
            IndexSpace::Zip => &self.organizations,
        };
        map.get(name).and_then(|keys| keys.get(key))
    }

    fn remember(&mut self, space: IndexSpace, name: &str, key: &str, id: &str) {
        let map = match space {
            IndexSpace::Job => &mut self.persons,
            IndexSpace::Zip => &mut self.organizations,
        };
        map.entry(name.to_string())
            .or_default()
            .insert(key.to_string(), id.to_string());
    }

    fn defer_index(&mut self, space: IndexSpace, name: &str, key: &str, id: &str) {
        self.pending_index.push(PendingIndexEntry {
            space,
            name: name.to_string(),
            key: key.to_string(),
            id: id.to_string(),
        });
    }
}

pub struct EntityResolver<'a> {
    year: &'a str,
    index: &'a dyn IdentityIndex,
    store: &'a dyn ObjectStore,
}

impl<'a> EntityResolver<'a> {
    pub fn new(year: &'a str, index: &'a dyn IdentityIndex, store: &'a dyn ObjectStore) -> Self {
        Self { year, index, store }
    }

    pub fn resolve(&self, cache: &mut BatchCache, identity: &Identity<'_>) -> Result<Resolution> {
        match *identity {
            Identity::Person {
                name,
                employer,
                occupation,
                zip,
                city,
                state,
            } => {
                let key = job_key(employer, occupation);
                self.resolve_by_index(cache, IndexSpace::Job, name, &key, || {
                    let id = person_id(name, employer, occupation, zip);
                    let entity = Entity::Individual(Individual {
                        id: id.clone(),
                        name: name.to_string(),
                        city: city.to_string(),
                        state: state.to_string(),
                        zip: zip.to_string(),
                        occupation: occupation.to_string(),
                        employer: employer.to_string(),
                        ..Default::default()
                    });
                    (id, entity)
                })
            }
            Identity::Organization {
                name,
                zip,
                city,
                state,
            } => self.resolve_by_index(cache, IndexSpace::Zip, name, zip.trim(), || {
                let id = organization_id(name, zip);
                let entity = Entity::Organization(Organization {
                    id: id.clone(),
                    name: name.to_string(),
                    city: city.to_string(),
                    state: state.to_string(),
                    zip: zip.to_string(),
                    ..Default::default()
                });
                (id, entity)
            }),
            Identity::Committee(id) => self.resolve_committee(cache, id),
            Identity::Candidate(id) => self.resolve_candidate(cache, id),
        }
    }

    fn resolve_by_index<F>(
        &self,
        cache: &mut BatchCache,
        space: IndexSpace,
        name: &str,
        key: &str,
        synthesize: F,
    ) -> Result<Resolution>
    where
        F: FnOnce() -> (String, Entity),
    {
        let kind = match space {
            IndexSpace::Job => EntityKind::Individual,
            IndexSpace::Zip => EntityKind::Organization,
        };

        if let Some(id) = cache.secondary(space, name, key) {
            if cache.get(id).is_some() {
                return Ok(Resolution {
                    id: id.clone(),
                    kind,
                    created: cache.is_created(id),
                });
            }
        }

        let indexed = self.index.lookup(space, name, key)?;
        let (id, fresh) = match &indexed {
            Some(entry) => {
                let (_, mut fresh) = synthesize();
                rename_entity(&mut fresh, &entry.id);
                (entry.id.clone(), fresh)
            }
            None => synthesize(),
        };

        let (entity, created) = match self.store.get_entity(self.year, kind, &id)? {
            Some(existing) => (existing, false),
            None => (fresh, true),
        };

        let needs_index = indexed.map_or(true, |entry| !entry.years.contains(self.year));
        if needs_index {
            cache.defer_index(space, name, key, &id);
        }
        debug!(
            "Resolved {} '{}' to {} (created: {})",
            kind, name, id, created
        );

        cache.remember(space, name, key, &id);
        cache.insert(entity, created);
        Ok(Resolution { id, kind, created })
    }

    /// Loads the filing ledger of a committee, or starts an empty one under
    /// a placeholder registration.
    pub fn resolve_committee(&self, cache: &mut BatchCache, id: &str) -> Result<Resolution> {
        let kind = EntityKind::Committee;
        if cache.get(id).is_some() {
            return Ok(Resolution {
                id: id.to_string(),
                kind,
                created: cache.is_created(id),
            });
        }

        let created = match self.store.get_entity(self.year, kind, id)? {
            Some(existing) => {
                cache.insert(existing, false);
                false
            }
            None => {
                let registration: Option<Committee> =
                    self.store.get_object(self.year, Bucket::Committees, id)?;
                let ledger = match &registration {
                    Some(committee) => CommitteeLedger::for_committee(committee),
                    None => {
                        cache
                            .placeholder_registrations
                            .insert(id.to_string(), placeholder_committee(id));
                        CommitteeLedger::new(id)
                    }
                };
                cache.insert(Entity::Committee(ledger), true);
                true
            }
        };
        Ok(Resolution {
            id: id.to_string(),
            kind,
            created,
        })
    }

    pub fn resolve_candidate(&self, cache: &mut BatchCache, id: &str) -> Result<Resolution> {
        let kind = EntityKind::Candidate;
        if cache.get(id).is_some() {
            return Ok(Resolution {
                id: id.to_string(),
                kind,
                created: cache.is_created(id),
            });
        }

        let created = match self.store.get_entity(self.year, kind, id)? {
            Some(existing) => {
                cache.insert(existing, false);
                false
            }
            None => {
                cache.insert(Entity::Candidate(Candidate::placeholder(id)), true);
                true
            }
        };
        Ok(Resolution {
            id: id.to_string(),
            kind,
            created,
        })
    }
}

fn rename_entity(entity: &mut Entity, id: &str) {
    match entity {
        Entity::Individual(e) => e.id = id.to_string(),
        Entity::Organization(e) => e.id = id.to_string(),
        Entity::Candidate(e) => e.id = id.to_string(),
        Entity::Committee(e) => e.cmte_id = id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::store::MemoryStore;

    fn jane<'r>() -> Identity<'r> {
        Identity::Person {
            name: "DOE, JANE",
            employer: "ACME",
            occupation: "ENGINEER",
            zip: "78701",
            city: "AUSTIN",
            state: "TX",
        }
    }

    #[test]
    fn test_same_identity_resolves_once_per_batch() {
        let index = MemoryIndex::new();
        let store = MemoryStore::new();
        let resolver = EntityResolver::new("2020", &index, &store);
        let mut cache = BatchCache::new();

        let first = resolver.resolve(&mut cache, &jane()).unwrap();
        let second = resolver.resolve(&mut cache, &jane()).unwrap();
        assert!(first.created);
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, person_id("DOE, JANE", "ACME", "ENGINEER", "78701"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pending_index().len(), 1);
    }

    #[test]
    fn test_index_hit_loads_stored_entity() {
        let index = MemoryIndex::new();
        let store = MemoryStore::new();
        let id = person_id("DOE, JANE", "ACME", "ENGINEER", "78701");
        let mut stored = Individual {
            id: id.clone(),
            name: "DOE, JANE".to_string(),
            ..Default::default()
        };
        stored.ledger.send("C001", 75.0, false);
        store
            .put_entity("2020", &Entity::Individual(stored))
            .unwrap();
        index
            .record_job("DOE, JANE", "ACME", "ENGINEER", &id, "2020")
            .unwrap();

        let resolver = EntityResolver::new("2020", &index, &store);
        let mut cache = BatchCache::new();
        let resolution = resolver.resolve(&mut cache, &jane()).unwrap();
        assert!(!resolution.created);
        assert!(cache.pending_index().is_empty());
        match cache.get(&resolution.id) {
            Some(Entity::Individual(indv)) => assert_eq!(indv.ledger.total_out_amt, 75.0),
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_index_hit_from_other_year_reuses_id() {
        let index = MemoryIndex::new();
        let store = MemoryStore::new();
        index
            .record_job("DOE, JANE", "ACME", "ENGINEER", "first-seen-id-2016", "2016")
            .unwrap();

        let resolver = EntityResolver::new("2020", &index, &store);
        let mut cache = BatchCache::new();
        let resolution = resolver.resolve(&mut cache, &jane()).unwrap();
        assert_eq!(resolution.id, "first-seen-id-2016");
        assert!(resolution.created);
        assert_eq!(cache.pending_index().len(), 1);
        assert_eq!(cache.get("first-seen-id-2016").map(|e| e.id()), Some("first-seen-id-2016"));
    }

    #[test]
    fn test_organization_keyed_by_zip() {
        let index = MemoryIndex::new();
        let store = MemoryStore::new();
        let resolver = EntityResolver::new("2020", &index, &store);
        let mut cache = BatchCache::new();

        let org = |zip: &'static str| Identity::Organization {
            name: "ACME INC",
            zip,
            city: "AUSTIN",
            state: "TX",
        };
        let a = resolver.resolve(&mut cache, &org("78701")).unwrap();
        let b = resolver.resolve(&mut cache, &org("10001")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, EntityKind::Organization);
    }

    #[test]
    fn test_unknown_committee_gets_placeholder() {
        let index = MemoryIndex::new();
        let store = MemoryStore::new();
        let resolver = EntityResolver::new("2020", &index, &store);
        let mut cache = BatchCache::new();

        let resolution = resolver.resolve_committee(&mut cache, "C00999999").unwrap();
        assert!(resolution.created);
        let placeholders: Vec<&Committee> = cache.placeholder_registrations().collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].name, "Unknown");

        let candidate = resolver.resolve_candidate(&mut cache, "H0XX00001").unwrap();
        match cache.get(&candidate.id) {
            Some(Entity::Candidate(c)) => assert_eq!(c.party, "UNK"),
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_take_missing_entity_errors() {
        let mut cache = BatchCache::new();
        assert!(matches!(
            cache.take("nope"),
            Err(AggregationError::MissingEntity(_))
        ));
    }
}
