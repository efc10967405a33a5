use crate::error::Result;
use crate::records::{CandidateRecord, CommitteeRecord};
use crate::schema::RankingBounds;
use crate::topk::Ranking;
use crate::utils::average;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// FEC IDs are short; identity hashes are not.
const MAX_FEC_ID_LEN: usize = 16;

pub const UNKNOWN_NAME: &str = "Unknown";
pub const UNKNOWN_PARTY: &str = "UNK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Individual,
    Organization,
    Candidate,
    Committee,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Individual => "individual",
            EntityKind::Organization => "organization",
            EntityKind::Candidate => "candidate",
            EntityKind::Committee => "committee",
        };
        write!(f, "{}", name)
    }
}

pub fn is_committee_id(id: &str) -> bool {
    id.len() < MAX_FEC_ID_LEN && id.starts_with('C')
}

pub fn is_candidate_id(id: &str) -> bool {
    id.len() < MAX_FEC_ID_LEN
        && (id.starts_with('H') || id.starts_with('S') || id.starts_with('P'))
}

/// Kind of the other party to a transaction, from its ID prefix and, for
/// non-FEC IDs, whether an occupation was reported.
pub fn counterparty_kind(id: &str, occupation: &str) -> EntityKind {
    if is_committee_id(id) {
        EntityKind::Committee
    } else if is_candidate_id(id) {
        EntityKind::Candidate
    } else if occupation.trim().is_empty() {
        EntityKind::Organization
    } else {
        EntityKind::Individual
    }
}

/// How far each input file has been folded into an entity.
///
/// Maps an input's checkpoint label to the end offset of the last committed
/// batch that carried the entity. The entity already reflects every row of
/// that input below the mark, so those rows are skipped on replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermarks(BTreeMap<String, u64>);

impl Watermarks {
    pub fn covers(&self, input: &str, row_offset: u64) -> bool {
        self.0.get(input).map_or(false, |end| row_offset < *end)
    }

    /// Never moves a mark backwards.
    pub fn advance(&mut self, input: &str, end: u64) {
        let mark = self.0.entry(input.to_string()).or_insert(0);
        if end > *mark {
            *mark = end;
        }
    }

    pub fn get(&self, input: &str) -> Option<u64> {
        self.0.get(input).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

fn add_into<V: Copy + std::ops::AddAssign + Default>(
    into: &mut BTreeMap<String, V>,
    from: &BTreeMap<String, V>,
) {
    for (id, value) in from {
        *into.entry(id.clone()).or_default() += *value;
    }
}

/// Running totals of a non-filing party.
///
/// `recipients_*` is money this party sent, keyed by receiving committee;
/// `senders_*` is money it received, keyed by sending committee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonorLedger {
    pub total_in_amt: f32,
    pub total_in_txs: u32,
    pub avg_tx_in: f32,
    pub total_out_amt: f32,
    pub total_out_txs: u32,
    pub avg_tx_out: f32,
    pub net_balance: f32,
    pub recipients_amt: BTreeMap<String, f32>,
    pub recipients_txs: BTreeMap<String, u32>,
    pub senders_amt: BTreeMap<String, f32>,
    pub senders_txs: BTreeMap<String, u32>,
    #[serde(default)]
    pub applied: Watermarks,
}

impl DonorLedger {
    /// Records money sent to `committee`. Returns the cumulative amount and
    /// count this party has sent to it.
    pub fn send(&mut self, committee: &str, amount: f32, memo: bool) -> (f32, u32) {
        if !memo {
            self.total_out_amt += amount;
            self.total_out_txs += 1;
            self.recompute();
        }
        let amt = self.recipients_amt.entry(committee.to_string()).or_default();
        *amt += amount;
        let txs = self.recipients_txs.entry(committee.to_string()).or_default();
        *txs += 1;
        (*amt, *txs)
    }

    /// Records money received from `committee`.
    pub fn receive(&mut self, committee: &str, amount: f32, memo: bool) -> (f32, u32) {
        if !memo {
            self.total_in_amt += amount;
            self.total_in_txs += 1;
            self.recompute();
        }
        let amt = self.senders_amt.entry(committee.to_string()).or_default();
        *amt += amount;
        let txs = self.senders_txs.entry(committee.to_string()).or_default();
        *txs += 1;
        (*amt, *txs)
    }

    /// Cumulative amount and count already sent to `committee`.
    pub fn sent_to(&self, committee: &str) -> (f32, u32) {
        (
            self.recipients_amt.get(committee).copied().unwrap_or(0.0),
            self.recipients_txs.get(committee).copied().unwrap_or(0),
        )
    }

    pub fn received_from(&self, committee: &str) -> (f32, u32) {
        (
            self.senders_amt.get(committee).copied().unwrap_or(0.0),
            self.senders_txs.get(committee).copied().unwrap_or(0),
        )
    }

    /// Adds another period's totals and maps into this one.
    pub fn absorb(&mut self, other: &DonorLedger) {
        self.total_in_amt += other.total_in_amt;
        self.total_in_txs += other.total_in_txs;
        self.total_out_amt += other.total_out_amt;
        self.total_out_txs += other.total_out_txs;
        add_into(&mut self.recipients_amt, &other.recipients_amt);
        add_into(&mut self.recipients_txs, &other.recipients_txs);
        add_into(&mut self.senders_amt, &other.senders_amt);
        add_into(&mut self.senders_txs, &other.senders_txs);
        self.applied.clear();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.avg_tx_in = average(self.total_in_amt, self.total_in_txs);
        self.avg_tx_out = average(self.total_out_amt, self.total_out_txs);
        self.net_balance = self.total_in_amt - self.total_out_amt;
    }

    pub fn is_untouched(&self) -> bool {
        self.total_in_txs == 0
            && self.total_out_txs == 0
            && self.recipients_txs.is_empty()
            && self.senders_txs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub id: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub occupation: String,
    pub employer: String,
    #[serde(flatten)]
    pub ledger: DonorLedger,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(flatten)]
    pub ledger: DonorLedger,
}

/// A candidate's registration plus the money sent or received directly,
/// outside of its committees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub party: String,
    pub election_year: String,
    pub office_state: String,
    pub office: String,
    pub pcc: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(default)]
    pub direct: DonorLedger,
}

impl Candidate {
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: UNKNOWN_NAME.to_string(),
            party: UNKNOWN_PARTY.to_string(),
            ..Default::default()
        }
    }

    pub fn from_record(record: &CandidateRecord) -> Self {
        let mut candidate = Self {
            id: record.id.clone(),
            ..Default::default()
        };
        candidate.refresh_registration(record);
        candidate
    }

    /// Overwrites registration fields only; direct totals are kept.
    pub fn refresh_registration(&mut self, record: &CandidateRecord) {
        self.name = record.name.clone();
        self.party = if record.party.is_empty() {
            UNKNOWN_PARTY.to_string()
        } else {
            record.party.clone()
        };
        self.election_year = record.election_year.clone();
        self.office_state = record.office_state.clone();
        self.office = record.office.clone();
        self.pcc = record.pcc.clone();
        self.city = record.city.clone();
        self.state = record.state.clone();
        self.zip = record.zip.clone();
    }
}

/// Registration data of a committee, as filed in the committee master file.
pub type Committee = CommitteeRecord;

pub fn placeholder_committee(id: &str) -> Committee {
    CommitteeRecord {
        id: id.to_string(),
        name: UNKNOWN_NAME.to_string(),
        treasurer: String::new(),
        city: String::new(),
        state: String::new(),
        zip: String::new(),
        designation: String::new(),
        cmte_type: String::new(),
        party: UNKNOWN_PARTY.to_string(),
        filing_freq: String::new(),
        org_type: String::new(),
        connected_org: String::new(),
        cand_id: String::new(),
    }
}

/// Which of a filing committee's four bounded rankings a transaction feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingSlot {
    IndividualContributors,
    CommitteeOrgContributors,
    TransferRecipients,
    ExpenseRecipients,
}

/// Transaction ledger of a filing committee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitteeLedger {
    pub cmte_id: String,
    pub cand_id: String,
    pub party: String,

    pub contributions_in_amt: f32,
    pub contributions_in_txs: u32,
    pub avg_contribution_in: f32,
    pub other_receipts_in_amt: f32,
    pub other_receipts_in_txs: u32,
    pub avg_other_in: f32,
    pub total_incoming_amt: f32,
    pub total_incoming_txs: u32,
    pub avg_incoming: f32,

    pub transfers_amt: f32,
    pub transfers_txs: u32,
    pub avg_transfer: f32,
    pub expenditures_amt: f32,
    pub expenditures_txs: u32,
    pub avg_expenditure: f32,
    pub total_outgoing_amt: f32,
    pub total_outgoing_txs: u32,
    pub avg_outgoing: f32,

    pub net_balance: f32,

    pub top_indv_contributors: Ranking,
    pub top_cmte_org_contributors: Ranking,
    pub transfer_recs: Ranking,
    pub top_exp_recipients: Ranking,

    #[serde(default)]
    pub applied: Watermarks,
}

impl CommitteeLedger {
    pub fn new(cmte_id: &str) -> Self {
        Self {
            cmte_id: cmte_id.to_string(),
            party: UNKNOWN_PARTY.to_string(),
            ..Default::default()
        }
    }

    pub fn for_committee(committee: &Committee) -> Self {
        let mut ledger = Self::new(&committee.id);
        ledger.refresh_registration(committee);
        ledger
    }

    pub fn refresh_registration(&mut self, committee: &Committee) {
        self.cand_id = committee.cand_id.clone();
        self.party = committee.party.clone();
    }

    pub fn credit_incoming(&mut self, amount: f32, other_receipt: bool) {
        if other_receipt {
            self.other_receipts_in_amt += amount;
            self.other_receipts_in_txs += 1;
        } else {
            self.contributions_in_amt += amount;
            self.contributions_in_txs += 1;
        }
        self.recompute();
    }

    pub fn debit_outgoing(&mut self, amount: f32, transfer: bool) {
        if transfer {
            self.transfers_amt += amount;
            self.transfers_txs += 1;
        } else {
            self.expenditures_amt += amount;
            self.expenditures_txs += 1;
        }
        self.recompute();
    }

    /// Derives every aggregate from its components. Never accumulated.
    pub fn recompute(&mut self) {
        self.total_incoming_amt = self.contributions_in_amt + self.other_receipts_in_amt;
        self.total_incoming_txs = self.contributions_in_txs + self.other_receipts_in_txs;
        self.total_outgoing_amt = self.transfers_amt + self.expenditures_amt;
        self.total_outgoing_txs = self.transfers_txs + self.expenditures_txs;

        self.avg_contribution_in = average(self.contributions_in_amt, self.contributions_in_txs);
        self.avg_other_in = average(self.other_receipts_in_amt, self.other_receipts_in_txs);
        self.avg_incoming = average(self.total_incoming_amt, self.total_incoming_txs);
        self.avg_transfer = average(self.transfers_amt, self.transfers_txs);
        self.avg_expenditure = average(self.expenditures_amt, self.expenditures_txs);
        self.avg_outgoing = average(self.total_outgoing_amt, self.total_outgoing_txs);

        self.net_balance = self.total_incoming_amt - self.total_outgoing_amt;
    }

    pub fn ranking(&self, slot: RankingSlot) -> &Ranking {
        match slot {
            RankingSlot::IndividualContributors => &self.top_indv_contributors,
            RankingSlot::CommitteeOrgContributors => &self.top_cmte_org_contributors,
            RankingSlot::TransferRecipients => &self.transfer_recs,
            RankingSlot::ExpenseRecipients => &self.top_exp_recipients,
        }
    }

    pub fn ranking_mut(&mut self, slot: RankingSlot) -> &mut Ranking {
        match slot {
            RankingSlot::IndividualContributors => &mut self.top_indv_contributors,
            RankingSlot::CommitteeOrgContributors => &mut self.top_cmte_org_contributors,
            RankingSlot::TransferRecipients => &mut self.transfer_recs,
            RankingSlot::ExpenseRecipients => &mut self.top_exp_recipients,
        }
    }

    /// Adds another year's ledger of the same committee. Rankings are
    /// folded entry by entry through the bounded admission.
    pub fn absorb(&mut self, other: &CommitteeLedger, bounds: &RankingBounds) -> Result<()> {
        self.contributions_in_amt += other.contributions_in_amt;
        self.contributions_in_txs += other.contributions_in_txs;
        self.other_receipts_in_amt += other.other_receipts_in_amt;
        self.other_receipts_in_txs += other.other_receipts_in_txs;
        self.transfers_amt += other.transfers_amt;
        self.transfers_txs += other.transfers_txs;
        self.expenditures_amt += other.expenditures_amt;
        self.expenditures_txs += other.expenditures_txs;
        self.recompute();

        self.top_indv_contributors
            .absorb(&other.top_indv_contributors, bounds)?;
        self.top_cmte_org_contributors
            .absorb(&other.top_cmte_org_contributors, bounds)?;
        self.transfer_recs.absorb(&other.transfer_recs, bounds)?;
        self.top_exp_recipients
            .absorb(&other.top_exp_recipients, bounds)?;
        self.applied.clear();
        Ok(())
    }
}

/// Every shape of entity the ledger engine mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Individual(Individual),
    Organization(Organization),
    Candidate(Candidate),
    Committee(CommitteeLedger),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Individual(e) => &e.id,
            Entity::Organization(e) => &e.id,
            Entity::Candidate(e) => &e.id,
            Entity::Committee(e) => &e.cmte_id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Individual(_) => EntityKind::Individual,
            Entity::Organization(_) => EntityKind::Organization,
            Entity::Candidate(_) => EntityKind::Candidate,
            Entity::Committee(_) => EntityKind::Committee,
        }
    }

    pub fn watermarks(&self) -> &Watermarks {
        match self {
            Entity::Individual(e) => &e.ledger.applied,
            Entity::Organization(e) => &e.ledger.applied,
            Entity::Candidate(e) => &e.direct.applied,
            Entity::Committee(e) => &e.applied,
        }
    }

    pub fn watermarks_mut(&mut self) -> &mut Watermarks {
        match self {
            Entity::Individual(e) => &mut e.ledger.applied,
            Entity::Organization(e) => &mut e.ledger.applied,
            Entity::Candidate(e) => &mut e.direct.applied,
            Entity::Committee(e) => &mut e.applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counterparty_kind_by_prefix() {
        assert_eq!(counterparty_kind("C00401224", ""), EntityKind::Committee);
        assert_eq!(counterparty_kind("H0AK00105", "LAWYER"), EntityKind::Candidate);
        assert_eq!(counterparty_kind("P00000001", ""), EntityKind::Candidate);
        assert_eq!(counterparty_kind("", ""), EntityKind::Organization);
        assert_eq!(counterparty_kind("", "ENGINEER"), EntityKind::Individual);

        let hash = crate::idhash::person_id("SMITH, CAROL", "", "", "10001");
        assert!(!is_committee_id(&hash));
        assert_eq!(counterparty_kind(&hash, "LIBRARIAN"), EntityKind::Individual);
    }

    #[test]
    fn test_memo_only_touches_maps() {
        let mut ledger = DonorLedger::default();
        ledger.send("C001", 100.0, false);
        let (amt, txs) = ledger.send("C001", 40.0, true);
        assert_eq!(amt, 140.0);
        assert_eq!(txs, 2);
        assert_eq!(ledger.total_out_amt, 100.0);
        assert_eq!(ledger.total_out_txs, 1);
        assert_eq!(ledger.net_balance, -100.0);
    }

    #[test]
    fn test_committee_aggregates_are_recomputed() {
        let mut ledger = CommitteeLedger::new("C001");
        ledger.credit_incoming(100.0, false);
        ledger.credit_incoming(50.0, true);
        ledger.debit_outgoing(30.0, true);
        ledger.debit_outgoing(20.0, false);

        assert_eq!(ledger.total_incoming_amt, 150.0);
        assert_eq!(ledger.total_incoming_txs, 2);
        assert_eq!(ledger.avg_incoming, 75.0);
        assert_eq!(ledger.total_outgoing_amt, 50.0);
        assert_eq!(ledger.net_balance, 100.0);
        assert_eq!(ledger.avg_transfer, 30.0);
        assert_eq!(ledger.avg_expenditure, 20.0);
    }

    #[test]
    fn test_candidate_refresh_keeps_direct_totals() {
        let record = CandidateRecord {
            id: "H0AK00105".to_string(),
            name: "LAMB, THOMAS".to_string(),
            party: "".to_string(),
            election_year: "2020".to_string(),
            office_state: "AK".to_string(),
            office: "H".to_string(),
            office_district: "00".to_string(),
            incumbent_challenger: "C".to_string(),
            status: "N".to_string(),
            pcc: "C00607515".to_string(),
            city: "ANCHORAGE".to_string(),
            state: "AK".to_string(),
            zip: "99517".to_string(),
        };
        let mut candidate = Candidate::from_record(&record);
        assert_eq!(candidate.party, UNKNOWN_PARTY);
        candidate.direct.receive("C001", 500.0, false);

        candidate.refresh_registration(&CandidateRecord {
            party: "NON".to_string(),
            ..record
        });
        assert_eq!(candidate.party, "NON");
        assert_eq!(candidate.direct.total_in_amt, 500.0);
    }

    #[test]
    fn test_watermarks_only_move_forward() {
        let mut marks = Watermarks::default();
        assert!(!marks.covers("cont_itcont", 0));

        marks.advance("cont_itcont", 400);
        marks.advance("cont_itcont", 120);
        assert_eq!(marks.get("cont_itcont"), Some(400));
        assert!(marks.covers("cont_itcont", 399));
        assert!(!marks.covers("cont_itcont", 400));
        assert!(!marks.covers("disb_oppexp", 10));
    }

    #[test]
    fn test_donor_absorb_sums_years() {
        let mut a = DonorLedger::default();
        a.send("C001", 100.0, false);
        a.applied.advance("cont_itcont", 50);
        let mut b = DonorLedger::default();
        b.send("C001", 50.0, false);
        b.send("C002", 25.0, false);
        b.receive("C003", 10.0, false);

        a.absorb(&b);
        assert_eq!(a.total_out_amt, 175.0);
        assert_eq!(a.total_out_txs, 3);
        assert_eq!(a.sent_to("C001"), (150.0, 2));
        assert_eq!(a.received_from("C003"), (10.0, 1));
        assert_eq!(a.net_balance, 10.0 - 175.0);
        assert!(a.applied.is_empty());
    }

    #[test]
    fn test_entity_round_trips_with_kind_tag() {
        let entity = Entity::Committee(CommitteeLedger::new("C001"));
        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("\"kind\":\"committee\""));
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), "C001");
        assert_eq!(back.kind(), EntityKind::Committee);
    }
}
