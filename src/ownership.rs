//! Share of a committee's contributions that can be traced to one donor.
//!
//! The direct share is what the donor gave the committee over the
//! committee's contributions. The total share also follows money through
//! intermediary committees: a donor owning half of a committee that
//! transferred a quarter of the target's contributions owns an eighth of
//! the target through it.

use crate::entities::{is_committee_id, CommitteeLedger, Entity, EntityKind};
use crate::error::{AggregationError, Result};
use crate::store::{ObjectStore, ObjectStoreExt};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

fn sent_amounts(source: &Entity) -> Result<&BTreeMap<String, f32>> {
    match source {
        Entity::Individual(person) => Ok(&person.ledger.recipients_amt),
        Entity::Organization(org) => Ok(&org.ledger.recipients_amt),
        Entity::Committee(ledger) => Ok(&ledger.transfer_recs.amts),
        Entity::Candidate(candidate) => Err(AggregationError::UnexpectedEntityKind {
            id: candidate.id.clone(),
            expected: "donor or committee".to_string(),
            found: EntityKind::Candidate.to_string(),
        }),
    }
}

fn share_of(amount: f32, of: &CommitteeLedger) -> f32 {
    if of.contributions_in_amt > 0.0 {
        amount / of.contributions_in_amt
    } else {
        0.0
    }
}

/// Fraction of `target`'s contributions received straight from `source`.
///
/// Transfer rankings are bounded, so a committee source outside the
/// target's top recipients reads as zero.
pub fn direct_share(source: &Entity, target: &CommitteeLedger) -> Result<f32> {
    let sent = sent_amounts(source)?;
    let amount = sent.get(&target.cmte_id).copied().unwrap_or(0.0);
    Ok(share_of(amount, target))
}

/// Direct share plus the shares carried through intermediary committees.
///
/// Each path visits a committee at most once. Ids without a stored ledger
/// in `year` end their path.
pub fn total_share(
    store: &dyn ObjectStore,
    year: &str,
    source: &Entity,
    target: &CommitteeLedger,
) -> Result<f32> {
    let sent = sent_amounts(source)?;
    let mut walk = OwnershipWalk {
        store,
        year,
        target,
        ledgers: BTreeMap::new(),
    };
    let mut path = BTreeSet::new();
    path.insert(source.id().to_string());
    path.insert(target.cmte_id.clone());

    let share = walk.share(sent, &mut path)?;
    debug!(
        "{} owns {:.4} of {} across {} committees",
        source.id(),
        share,
        target.cmte_id,
        walk.ledgers.len()
    );
    Ok(share)
}

struct OwnershipWalk<'a> {
    store: &'a dyn ObjectStore,
    year: &'a str,
    target: &'a CommitteeLedger,
    ledgers: BTreeMap<String, Option<Rc<CommitteeLedger>>>,
}

impl OwnershipWalk<'_> {
    fn ledger(&mut self, id: &str) -> Result<Option<Rc<CommitteeLedger>>> {
        if let Some(known) = self.ledgers.get(id) {
            return Ok(known.clone());
        }
        let loaded = match self.store.get_entity(self.year, EntityKind::Committee, id)? {
            Some(Entity::Committee(ledger)) => Some(Rc::new(ledger)),
            _ => None,
        };
        self.ledgers.insert(id.to_string(), loaded.clone());
        Ok(loaded)
    }

    fn share(&mut self, sent: &BTreeMap<String, f32>, path: &mut BTreeSet<String>) -> Result<f32> {
        let direct = sent.get(&self.target.cmte_id).copied().unwrap_or(0.0);
        let mut share = share_of(direct, self.target);

        for (via, amount) in sent {
            if path.contains(via) || !is_committee_id(via) {
                continue;
            }
            let Some(intermediary) = self.ledger(via)? else {
                continue;
            };
            let owned = share_of(*amount, &intermediary);
            if owned == 0.0 {
                continue;
            }
            path.insert(via.clone());
            let downstream = self.share(&intermediary.transfer_recs.amts, path)?;
            path.remove(via);
            share += owned * downstream;
        }
        Ok(share)
    }
}
