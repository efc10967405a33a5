//! Cross-year views of one entity.
//!
//! Each election cycle is aggregated on its own. A merged view adds the
//! ledgers of several cycles together. Registration fields come from the
//! first year that holds the entity, and bounded rankings are folded back
//! through the Top-K admission so the merged view keeps the same bounds.

use crate::entities::{Entity, EntityKind};
use crate::error::{AggregationError, Result};
use crate::index::IndexEntry;
use crate::schema::RankingBounds;
use crate::store::{ObjectStore, ObjectStoreExt};
use log::debug;

fn absorb(into: &mut Entity, other: &Entity, bounds: &RankingBounds) -> Result<()> {
    match (into, other) {
        (Entity::Individual(a), Entity::Individual(b)) => a.ledger.absorb(&b.ledger),
        (Entity::Organization(a), Entity::Organization(b)) => a.ledger.absorb(&b.ledger),
        (Entity::Candidate(a), Entity::Candidate(b)) => a.direct.absorb(&b.direct),
        (Entity::Committee(a), Entity::Committee(b)) => a.absorb(b, bounds)?,
        (into, other) => {
            return Err(AggregationError::UnexpectedEntityKind {
                id: other.id().to_string(),
                expected: into.kind().to_string(),
                found: other.kind().to_string(),
            })
        }
    }
    Ok(())
}

/// Adds up the stored ledgers of `id` across `years`, in the given order.
///
/// Years without the entity are skipped. Returns `None` when no year holds it.
pub fn merge_years<'y, I>(
    store: &dyn ObjectStore,
    years: I,
    kind: EntityKind,
    id: &str,
    bounds: &RankingBounds,
) -> Result<Option<Entity>>
where
    I: IntoIterator<Item = &'y str>,
{
    let mut merged: Option<Entity> = None;
    let mut found = 0;

    for year in years {
        let entity = match store.get_entity(year, kind, id)? {
            Some(entity) => entity,
            None => {
                debug!("No {} {} in {}", kind, id, year);
                continue;
            }
        };
        found += 1;
        match merged.as_mut() {
            Some(base) => absorb(base, &entity, bounds)?,
            None => {
                let mut base = entity;
                // A merged view is never written back as a cycle's ledger.
                base.watermarks_mut().clear();
                merged = Some(base);
            }
        }
    }

    debug!("Merged {} yearly ledgers of {} {}", found, kind, id);
    Ok(merged)
}

/// Merges every year an identity index entry has recorded for the entity.
pub fn merge_indexed(
    store: &dyn ObjectStore,
    entry: &IndexEntry,
    kind: EntityKind,
    bounds: &RankingBounds,
) -> Result<Option<Entity>> {
    merge_years(
        store,
        entry.years.iter().map(String::as_str),
        kind,
        &entry.id,
        bounds,
    )
}
