//! Dataset-wide rankings and yearly totals.
//!
//! Built after the primary files of a year have been processed, by scanning
//! the stored entities page by page.

use crate::entities::{Candidate, CommitteeLedger, Individual, Organization};
use crate::error::Result;
use crate::schema::{AggregationConfig, RankingBounds};
use crate::store::{Bucket, ObjectStore, ObjectStoreExt};
use crate::topk::Ranking;
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Party {
    All,
    Rep,
    Dem,
    Ind,
    Oth,
    Unk,
}

impl Party {
    pub fn from_code(code: &str) -> Party {
        match code.trim().to_ascii_uppercase().as_str() {
            "REP" => Party::Rep,
            "DEM" => Party::Dem,
            "IND" | "NNE" | "NPA" => Party::Ind,
            "" | "UNK" => Party::Unk,
            _ => Party::Oth,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Party::All => "ALL",
            Party::Rep => "REP",
            Party::Dem => "DEM",
            Party::Ind => "IND",
            Party::Oth => "OTH",
            Party::Unk => "UNK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Donor,
    Recipient,
    Expenditure,
}

impl Category {
    pub fn code(&self) -> &'static str {
        match self {
            Category::Donor => "donor",
            Category::Recipient => "rec",
            Category::Expenditure => "exp",
        }
    }
}

pub fn dataset_key(year: &str, bucket: Bucket, category: Category, party: Party) -> String {
    format!(
        "{}-{}-{}-{}",
        year,
        bucket.name(),
        category.code(),
        party.code()
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOverallData {
    pub id: String,
    pub year: String,
    pub bucket: Bucket,
    pub category: Category,
    pub party: Party,
    pub size_limit: usize,
    pub ranking: Ranking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyTotal {
    pub id: String,
    pub year: String,
    pub bucket: Bucket,
    pub category: Category,
    pub party: Party,
    pub total: f32,
    pub count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SecondaryDatasets {
    pub rankings: BTreeMap<String, TopOverallData>,
    pub totals: BTreeMap<String, YearlyTotal>,
}

struct SecondaryBuilder<'c> {
    year: String,
    config: &'c AggregationConfig,
    out: SecondaryDatasets,
}

impl<'c> SecondaryBuilder<'c> {
    fn limit_for(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::Individuals => self.config.top_overall.individuals_limit,
            _ => self.config.top_overall.default_limit,
        }
    }

    /// Counts `total` for `party` and for the all-party aggregate.
    fn offer(
        &mut self,
        bucket: Bucket,
        category: Category,
        party: Party,
        id: &str,
        total: f32,
        txs: u32,
    ) -> Result<()> {
        if txs == 0 {
            return Ok(());
        }
        let size_limit = self.limit_for(bucket);
        let bounds = RankingBounds::new(
            size_limit,
            self.config.ranking.threshold_window.min(size_limit).max(1),
        );

        let parties = if party == Party::All {
            vec![Party::All]
        } else {
            vec![Party::All, party]
        };
        for p in parties {
            let key = dataset_key(&self.year, bucket, category, p);
            let year = self.year.clone();

            let top = self
                .out
                .rankings
                .entry(key.clone())
                .or_insert_with(|| TopOverallData {
                    id: key.clone(),
                    year: year.clone(),
                    bucket,
                    category,
                    party: p,
                    size_limit,
                    ranking: Ranking::new(),
                });
            top.ranking.admit(id, total, txs, &bounds)?;

            let sum = self
                .out
                .totals
                .entry(key.clone())
                .or_insert_with(|| YearlyTotal {
                    id: key,
                    year,
                    bucket,
                    category,
                    party: p,
                    total: 0.0,
                    count: 0,
                });
            sum.total += total;
            sum.count += 1;
        }
        Ok(())
    }
}

fn scan<T, F>(
    store: &dyn ObjectStore,
    year: &str,
    bucket: Bucket,
    page_size: usize,
    mut visit: F,
) -> Result<usize>
where
    T: DeserializeOwned,
    F: FnMut(&str, T) -> Result<()>,
{
    let mut cursor: Option<String> = None;
    let mut seen = 0;
    loop {
        let page = store.batch_get_sequential::<T>(year, bucket, cursor.as_deref(), page_size)?;
        for (id, obj) in page.items {
            visit(&id, obj)?;
            seen += 1;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(seen),
        }
    }
}

/// Scans every stored ledger of `year` and builds the top-overall rankings
/// and yearly totals.
pub fn build_secondary(store: &dyn ObjectStore, config: &AggregationConfig) -> Result<SecondaryDatasets> {
    let year = config.year.as_str();
    let page_size = config.batch_size.max(1);
    let mut builder = SecondaryBuilder {
        year: year.to_string(),
        config,
        out: SecondaryDatasets::default(),
    };

    let individuals = scan(store, year, Bucket::Individuals, page_size, |id, e: Individual| {
        let l = &e.ledger;
        builder.offer(Bucket::Individuals, Category::Donor, Party::All, id, l.total_out_amt, l.total_out_txs)?;
        builder.offer(Bucket::Individuals, Category::Recipient, Party::All, id, l.total_in_amt, l.total_in_txs)
    })?;

    let organizations = scan(store, year, Bucket::Organizations, page_size, |id, e: Organization| {
        let l = &e.ledger;
        builder.offer(Bucket::Organizations, Category::Donor, Party::All, id, l.total_out_amt, l.total_out_txs)?;
        builder.offer(Bucket::Organizations, Category::Recipient, Party::All, id, l.total_in_amt, l.total_in_txs)
    })?;

    let committees = scan(store, year, Bucket::CmteTxData, page_size, |id, e: CommitteeLedger| {
        let party = Party::from_code(&e.party);
        let b = Bucket::CmteTxData;
        builder.offer(b, Category::Recipient, party, id, e.total_incoming_amt, e.total_incoming_txs)?;
        builder.offer(b, Category::Donor, party, id, e.transfers_amt, e.transfers_txs)?;
        builder.offer(b, Category::Expenditure, party, id, e.expenditures_amt, e.expenditures_txs)
    })?;

    let candidates = scan(store, year, Bucket::Candidates, page_size, |id, e: Candidate| {
        let party = Party::from_code(&e.party);
        let d = &e.direct;
        builder.offer(Bucket::Candidates, Category::Recipient, party, id, d.total_in_amt, d.total_in_txs)?;
        builder.offer(Bucket::Candidates, Category::Donor, party, id, d.total_out_amt, d.total_out_txs)
    })?;

    info!(
        "Built {} rankings for {} from {} individuals, {} organizations, {} committees, {} candidates",
        builder.out.rankings.len(),
        year,
        individuals,
        organizations,
        committees,
        candidates
    );
    Ok(builder.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn committee(id: &str, party: &str, incoming: f32) -> CommitteeLedger {
        let mut ledger = CommitteeLedger::new(id);
        ledger.party = party.to_string();
        ledger.credit_incoming(incoming, false);
        ledger
    }

    #[test]
    fn test_party_codes() {
        assert_eq!(Party::from_code("rep"), Party::Rep);
        assert_eq!(Party::from_code("UNK"), Party::Unk);
        assert_eq!(Party::from_code("GRE"), Party::Oth);
        assert_eq!(
            dataset_key("2020", Bucket::CmteTxData, Category::Recipient, Party::Dem),
            "2020-cmte_tx_data-rec-DEM"
        );
    }

    #[test]
    fn test_committee_rankings_by_party() {
        let store = MemoryStore::new();
        for ledger in [
            committee("C001", "DEM", 500.0),
            committee("C002", "REP", 900.0),
            committee("C003", "DEM", 100.0),
        ] {
            store
                .put_object("2020", Bucket::CmteTxData, &ledger.cmte_id.clone(), &ledger)
                .unwrap();
        }
        let mut config = AggregationConfig::new("2020");
        config.batch_size = 2;

        let out = build_secondary(&store, &config).unwrap();
        let all = &out.rankings["2020-cmte_tx_data-rec-ALL"];
        assert_eq!(all.ranking.len(), 3);
        let dem = &out.rankings["2020-cmte_tx_data-rec-DEM"];
        assert_eq!(dem.ranking.len(), 2);
        assert!(!dem.ranking.contains("C002"));

        let total = &out.totals["2020-cmte_tx_data-rec-DEM"];
        assert_eq!(total.total, 600.0);
        assert_eq!(total.count, 2);
        // No transfers were made, so there is no donor ranking.
        assert!(!out.rankings.contains_key("2020-cmte_tx_data-donor-ALL"));
    }

    #[test]
    fn test_top_overall_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..20u32 {
            let id = format!("C{:03}", i);
            let ledger = committee(&id, "IND", (i + 1) as f32 * 10.0);
            store
                .put_object("2020", Bucket::CmteTxData, &id, &ledger)
                .unwrap();
        }
        let mut config = AggregationConfig::new("2020");
        config.top_overall.default_limit = 5;
        config.ranking.threshold_window = 2;

        let out = build_secondary(&store, &config).unwrap();
        let top = &out.rankings["2020-cmte_tx_data-rec-IND"];
        assert_eq!(top.ranking.len(), 5);
        let ids: Vec<String> = top
            .ranking
            .sorted_entries()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["C019", "C018", "C017", "C016", "C015"]);
        assert_eq!(out.totals["2020-cmte_tx_data-rec-IND"].count, 20);
    }
}
