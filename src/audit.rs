use crate::entities::{CommitteeLedger, DonorLedger, Entity};
use crate::error::{AggregationError, Result};
use crate::resolver::BatchCache;
use crate::schema::RankingBounds;
use crate::topk::Ranking;
use crate::utils::approx_eq;
use log::debug;

/// Checks the accounting identities and ranking invariants of ledgers.
pub struct LedgerAuditor {
    bounds: RankingBounds,
    tolerance: f32,
}

impl LedgerAuditor {
    pub fn new(bounds: RankingBounds, tolerance: f32) -> Self {
        Self { bounds, tolerance }
    }

    pub fn verify_committee(&self, ledger: &CommitteeLedger) -> Result<()> {
        let id = &ledger.cmte_id;
        self.check(
            id,
            "total incoming",
            ledger.total_incoming_amt,
            ledger.contributions_in_amt + ledger.other_receipts_in_amt,
        )?;
        self.check(
            id,
            "total outgoing",
            ledger.total_outgoing_amt,
            ledger.transfers_amt + ledger.expenditures_amt,
        )?;
        self.check(
            id,
            "net balance",
            ledger.net_balance,
            ledger.total_incoming_amt - ledger.total_outgoing_amt,
        )?;
        if ledger.total_incoming_txs != ledger.contributions_in_txs + ledger.other_receipts_in_txs
            || ledger.total_outgoing_txs != ledger.transfers_txs + ledger.expenditures_txs
        {
            return Err(AggregationError::LedgerImbalance {
                id: id.clone(),
                details: "transaction counts do not add up".to_string(),
            });
        }

        for (name, ranking) in [
            ("top individual contributors", &ledger.top_indv_contributors),
            ("top committee/org contributors", &ledger.top_cmte_org_contributors),
            ("transfer recipients", &ledger.transfer_recs),
            ("top expense recipients", &ledger.top_exp_recipients),
        ] {
            self.verify_ranking(id, name, ranking)?;
        }
        Ok(())
    }

    pub fn verify_donor(&self, id: &str, ledger: &DonorLedger) -> Result<()> {
        self.check(
            id,
            "net balance",
            ledger.net_balance,
            ledger.total_in_amt - ledger.total_out_amt,
        )
    }

    pub fn verify_ranking(&self, id: &str, name: &str, ranking: &Ranking) -> Result<()> {
        let imbalance = |details: String| AggregationError::LedgerImbalance {
            id: id.to_string(),
            details: format!("{}: {}", name, details),
        };

        if ranking.len() > self.bounds.top_k {
            return Err(imbalance(format!(
                "{} entries exceed bound {}",
                ranking.len(),
                self.bounds.top_k
            )));
        }
        if ranking.amts.len() != ranking.txs.len()
            || ranking.amts.keys().any(|k| !ranking.txs.contains_key(k))
        {
            return Err(imbalance("amount and count maps disagree".to_string()));
        }

        let window = &ranking.threshold;
        if window.is_empty() {
            return Ok(());
        }
        for entry in window.entries() {
            if ranking.amount(&entry.id) != Some(entry.total) {
                return Err(imbalance(format!("stale threshold entry {}", entry.id)));
            }
        }
        let window_min = window.min().map(|e| e.id.as_str());
        let ranking_min = ranking.min_entry().map(|e| e.id);
        if window_min != ranking_min.as_deref() {
            return Err(imbalance(format!(
                "threshold minimum {:?} is not the ranking minimum {:?}",
                window_min, ranking_min
            )));
        }
        Ok(())
    }

    /// Verifies every entity touched by a batch.
    pub fn audit_batch(&self, cache: &BatchCache) -> Result<usize> {
        let mut checked = 0;
        for entity in cache.entities() {
            match entity {
                Entity::Committee(ledger) => self.verify_committee(ledger)?,
                Entity::Individual(e) => self.verify_donor(&e.id, &e.ledger)?,
                Entity::Organization(e) => self.verify_donor(&e.id, &e.ledger)?,
                Entity::Candidate(e) => self.verify_donor(&e.id, &e.direct)?,
            }
            checked += 1;
        }
        debug!("Audited {} ledgers", checked);
        Ok(checked)
    }

    fn check(&self, id: &str, what: &str, actual: f32, expected: f32) -> Result<()> {
        if approx_eq(actual, expected, self.tolerance) {
            Ok(())
        } else {
            Err(AggregationError::LedgerImbalance {
                id: id.to_string(),
                details: format!("{} is {} but components sum to {}", what, actual, expected),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topk::Entry;

    fn auditor() -> LedgerAuditor {
        LedgerAuditor::new(RankingBounds::new(3, 2), 0.01)
    }

    #[test]
    fn test_recomputed_ledger_passes() {
        let mut ledger = CommitteeLedger::new("C001");
        ledger.credit_incoming(100.0, false);
        ledger.debit_outgoing(40.0, false);
        assert!(auditor().verify_committee(&ledger).is_ok());
    }

    #[test]
    fn test_tampered_total_is_reported() {
        let mut ledger = CommitteeLedger::new("C001");
        ledger.credit_incoming(100.0, false);
        ledger.total_incoming_amt += 5.0;
        match auditor().verify_committee(&ledger) {
            Err(AggregationError::LedgerImbalance { id, details }) => {
                assert_eq!(id, "C001");
                assert!(details.contains("total incoming"));
            }
            other => panic!("expected imbalance, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_ranking_is_reported() {
        let mut ranking = Ranking::new();
        for (id, total) in [("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0)] {
            ranking.amts.insert(id.to_string(), total);
            ranking.txs.insert(id.to_string(), 1);
        }
        assert!(auditor().verify_ranking("C001", "test", &ranking).is_err());
    }

    #[test]
    fn test_window_must_track_ranking_minimum() {
        let bounds = RankingBounds::new(3, 2);
        let mut ranking = Ranking::new();
        for (id, total) in [("A", 100.0), ("B", 150.0), ("C", 80.0), ("D", 120.0)] {
            ranking.admit(id, total, 1, &bounds).unwrap();
        }
        assert!(auditor().verify_ranking("C001", "test", &ranking).is_ok());

        // Bypassing admit leaves the cached minimum behind.
        ranking.amts.insert("A".to_string(), 50.0);
        assert!(auditor().verify_ranking("C001", "test", &ranking).is_err());
        assert_eq!(ranking.threshold.entries()[0], Entry::new("A", 100.0));
    }
}
