//! Typed rows of the FEC bulk files.
//!
//! Each struct maps the positional fields of one pipe-delimited file kind.
//! Numeric fields that fail to parse degrade to zero and dates to `None`;
//! a bad row never aborts its batch.

use crate::parser::{FecRecord, Fields};
use crate::utils::{parse_amount, parse_fec_date, parse_i32, parse_u64};
use chrono::NaiveDate;
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Candidate,
    Committee,
    CommitteeFinancials,
    Contribution,
    Disbursement,
}

impl RecordKind {
    pub fn checkpoint_label(&self) -> &'static str {
        match self {
            RecordKind::Candidate => "cand",
            RecordKind::Committee => "cmte",
            RecordKind::CommitteeFinancials => "cmte_fin",
            RecordKind::Contribution => "cont",
            RecordKind::Disbursement => "disb",
        }
    }
}

fn date_field(fields: &Fields, idx: usize, row_id: &str) -> Option<NaiveDate> {
    let raw = fields.get(idx);
    if raw.is_empty() {
        return None;
    }
    let date = parse_fec_date(raw);
    if date.is_none() {
        warn!("Malformed date '{}' in row {}; leaving date empty", raw, row_id);
    }
    date
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub name: String,
    pub party: String,
    pub election_year: String,
    pub office_state: String,
    pub office: String,
    pub office_district: String,
    pub incumbent_challenger: String,
    pub status: String,
    pub pcc: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl FecRecord for CandidateRecord {
    const KIND: RecordKind = RecordKind::Candidate;

    fn from_fields(fields: &Fields) -> Self {
        Self {
            id: fields.string(0),
            name: fields.string(1),
            party: fields.string(2),
            election_year: fields.string(3),
            office_state: fields.string(4),
            office: fields.string(5),
            office_district: fields.string(6),
            incumbent_challenger: fields.string(7),
            status: fields.string(8),
            pcc: fields.string(9),
            city: fields.string(12),
            state: fields.string(13),
            zip: fields.string(14),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitteeRecord {
    pub id: String,
    pub name: String,
    pub treasurer: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub designation: String,
    pub cmte_type: String,
    pub party: String,
    pub filing_freq: String,
    pub org_type: String,
    pub connected_org: String,
    pub cand_id: String,
}

impl FecRecord for CommitteeRecord {
    const KIND: RecordKind = RecordKind::Committee;

    fn from_fields(fields: &Fields) -> Self {
        let party = match fields.get(10) {
            "" => "UNK".to_string(),
            p => p.to_string(),
        };
        Self {
            id: fields.string(0),
            name: fields.string(1),
            treasurer: fields.string(2),
            city: fields.string(5),
            state: fields.string(6),
            zip: fields.string(7),
            designation: fields.string(8),
            cmte_type: fields.string(9),
            party,
            filing_freq: fields.string(11),
            org_type: fields.string(12),
            connected_org: fields.string(13),
            cand_id: fields.string(14),
        }
    }
}

/// Committee financial summary (webk) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmteFinancials {
    pub cmte_id: String,
    pub name: String,
    pub cmte_type: String,
    pub designation: String,
    pub filing_freq: String,
    pub total_receipts: f32,
    pub txs_from_aff: f32,
    pub indv_conts: f32,
    pub other_conts: f32,
    pub cand_cont: f32,
    pub total_loans: f32,
    pub total_disb: f32,
    pub tx_to_aff: f32,
    pub indv_refunds: f32,
    pub other_refunds: f32,
    pub loan_repay: f32,
    pub cash_bop: f32,
    pub cash_cop: f32,
    pub debts_owed: f32,
    pub non_fed_txs_recvd: f32,
    pub cont_to_other_cmte: f32,
    pub ind_exp: f32,
    pub party_exp: f32,
    pub non_fed_shared_exp: f32,
    pub coverage_end: Option<NaiveDate>,
}

impl FecRecord for CmteFinancials {
    const KIND: RecordKind = RecordKind::CommitteeFinancials;

    fn from_fields(fields: &Fields) -> Self {
        let cmte_id = fields.string(0);
        let coverage_end = date_field(fields, 24, &cmte_id);
        let amt = |idx: usize| parse_amount(fields.get(idx));
        Self {
            name: fields.string(1),
            cmte_type: fields.string(2),
            designation: fields.string(3),
            filing_freq: fields.string(4),
            total_receipts: amt(5),
            txs_from_aff: amt(6),
            indv_conts: amt(7),
            other_conts: amt(8),
            cand_cont: amt(9),
            total_loans: amt(10),
            total_disb: amt(11),
            tx_to_aff: amt(12),
            indv_refunds: amt(13),
            other_refunds: amt(14),
            loan_repay: amt(15),
            cash_bop: amt(16),
            cash_cop: amt(17),
            debts_owed: amt(18),
            non_fed_txs_recvd: amt(19),
            cont_to_other_cmte: amt(20),
            ind_exp: amt(21),
            party_exp: amt(22),
            non_fed_shared_exp: amt(23),
            coverage_end,
            cmte_id,
        }
    }
}

/// Contribution or committee transaction row (itcont / itpas2 / itoth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub cmte_id: String,
    pub amndt_ind: String,
    pub report_type: String,
    pub tx_pgi: String,
    pub image_num: String,
    pub tx_type: String,
    pub entity_type: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub employer: String,
    pub occupation: String,
    pub tx_date: Option<NaiveDate>,
    pub tx_amt: f32,
    pub other_id: String,
    pub tx_id: String,
    pub file_num: i32,
    pub memo_code: String,
    pub memo_text: String,
    pub sub_id: u64,
}

impl FecRecord for Contribution {
    const KIND: RecordKind = RecordKind::Contribution;

    fn from_fields(fields: &Fields) -> Self {
        let tx_id = fields.string(16);
        Self {
            cmte_id: fields.string(0),
            amndt_ind: fields.string(1),
            report_type: fields.string(2),
            tx_pgi: fields.string(3),
            image_num: fields.string(4),
            tx_type: fields.string(5),
            entity_type: fields.string(6),
            name: fields.string(7),
            city: fields.string(8),
            state: fields.string(9),
            zip: fields.string(10),
            employer: fields.string(11),
            occupation: fields.string(12),
            tx_date: date_field(fields, 13, &tx_id),
            tx_amt: parse_amount(fields.get(14)),
            other_id: fields.string(15),
            file_num: parse_i32(fields.get(17)),
            memo_code: fields.string(18),
            memo_text: fields.string(19),
            sub_id: parse_u64(fields.get(20)),
            tx_id,
        }
    }
}

/// Operating expenditure row (oppexp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disbursement {
    pub cmte_id: String,
    pub amndt_ind: String,
    pub report_year: i32,
    pub report_type: String,
    pub image_num: String,
    pub line_num: String,
    pub form_type: String,
    pub sched_type: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub tx_date: Option<NaiveDate>,
    pub tx_amt: f32,
    pub tx_pgi: String,
    pub purpose: String,
    pub category: String,
    pub category_desc: String,
    pub memo_code: String,
    pub memo_text: String,
    pub entity_type: String,
    pub sub_id: u64,
    pub file_num: i32,
    pub tx_id: String,
    pub back_ref_tx_id: String,
}

impl FecRecord for Disbursement {
    const KIND: RecordKind = RecordKind::Disbursement;

    fn from_fields(fields: &Fields) -> Self {
        let tx_id = fields.string(23);
        Self {
            cmte_id: fields.string(0),
            amndt_ind: fields.string(1),
            report_year: parse_i32(fields.get(2)),
            report_type: fields.string(3),
            image_num: fields.string(4),
            line_num: fields.string(5),
            form_type: fields.string(6),
            sched_type: fields.string(7),
            name: fields.string(8),
            city: fields.string(9),
            state: fields.string(10),
            zip: fields.string(11),
            tx_date: date_field(fields, 12, &tx_id),
            tx_amt: parse_amount(fields.get(13)),
            tx_pgi: fields.string(14),
            purpose: fields.string(15),
            category: fields.string(16),
            category_desc: fields.string(17),
            memo_code: fields.string(18),
            memo_text: fields.string(19),
            entity_type: fields.string(20),
            sub_id: parse_u64(fields.get(21)),
            file_num: parse_i32(fields.get(22)),
            back_ref_tx_id: fields.string(24),
            tx_id,
        }
    }
}
