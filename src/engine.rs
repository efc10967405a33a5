use crate::entities::{
    Candidate, CommitteeLedger, DonorLedger, Entity, EntityKind, Individual, Organization,
    RankingSlot, Watermarks,
};
use crate::error::{AggregationError, Result};
use crate::records::{Contribution, Disbursement};
use crate::resolver::BatchCache;
use crate::schema::{RankingBounds, TxTypeTable};
use crate::topk::Admission;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Money received by the filer.
    Incoming,
    /// Money paid out by the filer.
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nature {
    Contribution,
    OtherReceipt,
    Transfer,
    Expenditure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxClass {
    pub direction: Direction,
    pub nature: Nature,
    /// Informational sub-entry: rankings and maps only, never totals.
    pub memo: bool,
}

pub fn classify(tx_type: &str, memo_code: &str, table: &TxTypeTable) -> TxClass {
    let code = tx_type.trim();
    let incoming = table.incoming.iter().any(|range| range.contains(code));

    let (direction, nature) = if incoming {
        let nature = if table.other_receipts.iter().any(|range| range.contains(code)) {
            Nature::OtherReceipt
        } else {
            Nature::Contribution
        };
        (Direction::Incoming, nature)
    } else if table.transfers.contains(code) {
        (Direction::Outgoing, Nature::Transfer)
    } else {
        (Direction::Outgoing, Nature::Expenditure)
    };

    TxClass {
        direction,
        nature,
        memo: is_memo(memo_code, table),
    }
}

fn is_memo(memo_code: &str, table: &TxTypeTable) -> bool {
    !table.memo_flag.is_empty() && memo_code.trim() == table.memo_flag
}

/// A classified transaction between a filing committee and a resolved counterparty.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub filer_id: String,
    pub counterparty_id: String,
    pub amount: f32,
    pub class: TxClass,
    pub sub_id: u64,
    /// Byte offset of the source row within its input file.
    pub row_offset: Option<u64>,
}

impl Transaction {
    pub fn from_contribution(
        cont: &Contribution,
        counterparty_id: impl Into<String>,
        table: &TxTypeTable,
    ) -> Self {
        Self {
            filer_id: cont.cmte_id.clone(),
            counterparty_id: counterparty_id.into(),
            amount: cont.tx_amt,
            class: classify(&cont.tx_type, &cont.memo_code, table),
            sub_id: cont.sub_id,
            row_offset: None,
        }
    }

    /// Operating expenses are always expenditures.
    pub fn from_disbursement(
        disb: &Disbursement,
        counterparty_id: impl Into<String>,
        table: &TxTypeTable,
    ) -> Self {
        Self {
            filer_id: disb.cmte_id.clone(),
            counterparty_id: counterparty_id.into(),
            amount: disb.tx_amt,
            class: TxClass {
                direction: Direction::Outgoing,
                nature: Nature::Expenditure,
                memo: is_memo(&disb.memo_code, table),
            },
            sub_id: disb.sub_id,
            row_offset: None,
        }
    }

    pub fn at_offset(mut self, offset: u64) -> Self {
        self.row_offset = Some(offset);
        self
    }
}

/// The other side of a transaction, borrowed mutably for the update.
///
/// Committees are only named: their own ledger is updated by their own
/// filing of the matching transaction.
#[derive(Debug)]
pub enum Counterparty<'e> {
    Individual(&'e mut Individual),
    Organization(&'e mut Organization),
    Candidate(&'e mut Candidate),
    Committee(&'e str),
}

impl Counterparty<'_> {
    pub fn id(&self) -> &str {
        match self {
            Counterparty::Individual(e) => &e.id,
            Counterparty::Organization(e) => &e.id,
            Counterparty::Candidate(e) => &e.id,
            Counterparty::Committee(id) => id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Counterparty::Individual(_) => EntityKind::Individual,
            Counterparty::Organization(_) => EntityKind::Organization,
            Counterparty::Candidate(_) => EntityKind::Candidate,
            Counterparty::Committee(_) => EntityKind::Committee,
        }
    }

    /// Ledger of the non-filing side, when it keeps one.
    fn ledger(&self) -> Option<&DonorLedger> {
        match self {
            Counterparty::Individual(e) => Some(&e.ledger),
            Counterparty::Organization(e) => Some(&e.ledger),
            Counterparty::Candidate(e) => Some(&e.direct),
            Counterparty::Committee(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Posted(Admission),
    /// The filer already held the row; only the counterparty was behind.
    Completed,
    Duplicate,
}

/// Applies classified transactions to both sides of the ledger.
///
/// With an input label set, each side skips rows its watermark already
/// covers, so a batch replayed after a partial commit counts once.
pub struct LedgerEngine {
    bounds: RankingBounds,
    input: Option<String>,
}

impl LedgerEngine {
    pub fn new(bounds: RankingBounds) -> Self {
        Self {
            bounds,
            input: None,
        }
    }

    pub fn for_input(mut self, label: impl Into<String>) -> Self {
        self.input = Some(label.into());
        self
    }

    fn covered(&self, marks: &Watermarks, tx: &Transaction) -> bool {
        match (&self.input, tx.row_offset) {
            (Some(input), Some(offset)) => marks.covers(input, offset),
            _ => false,
        }
    }

    pub fn apply(
        &self,
        tx: &Transaction,
        filer: &mut CommitteeLedger,
        counterparty: Counterparty<'_>,
    ) -> Result<Applied> {
        let filer_due = !self.covered(&filer.applied, tx);
        let counterparty_due = counterparty
            .ledger()
            .map_or(false, |ledger| !self.covered(&ledger.applied, tx));
        if !filer_due && !counterparty_due {
            debug!(
                "Skipping already applied row {} for {}",
                tx.sub_id, filer.cmte_id
            );
            return Ok(Applied::Duplicate);
        }

        let memo = tx.class.memo;
        let amount = tx.amount;
        let filer_id = filer.cmte_id.clone();

        let admission = match tx.class.direction {
            Direction::Incoming => {
                if filer_due && !memo {
                    filer.credit_incoming(amount, tx.class.nature == Nature::OtherReceipt);
                }
                match counterparty {
                    Counterparty::Individual(sender) => {
                        let (total, txs) = post_send(&mut sender.ledger, counterparty_due, &filer_id, amount, memo);
                        self.rank(filer_due, filer, RankingSlot::IndividualContributors, &sender.id, total, txs)?
                    }
                    Counterparty::Candidate(sender) => {
                        let (total, txs) = post_send(&mut sender.direct, counterparty_due, &filer_id, amount, memo);
                        self.rank(filer_due, filer, RankingSlot::IndividualContributors, &sender.id, total, txs)?
                    }
                    Counterparty::Organization(sender) => {
                        let (total, txs) = post_send(&mut sender.ledger, counterparty_due, &filer_id, amount, memo);
                        self.rank(filer_due, filer, RankingSlot::CommitteeOrgContributors, &sender.id, total, txs)?
                    }
                    Counterparty::Committee(sender_id) => {
                        self.rank_running(filer_due, filer, RankingSlot::CommitteeOrgContributors, sender_id, amount)?
                    }
                }
            }
            Direction::Outgoing => {
                let transfer = tx.class.nature == Nature::Transfer;
                if filer_due && !memo {
                    filer.debit_outgoing(amount, transfer);
                }
                match counterparty {
                    Counterparty::Individual(receiver) => {
                        let (total, txs) = post_receive(&mut receiver.ledger, counterparty_due, &filer_id, amount, memo);
                        self.rank(filer_due, filer, RankingSlot::ExpenseRecipients, &receiver.id, total, txs)?
                    }
                    Counterparty::Organization(receiver) => {
                        let (total, txs) = post_receive(&mut receiver.ledger, counterparty_due, &filer_id, amount, memo);
                        self.rank(filer_due, filer, RankingSlot::ExpenseRecipients, &receiver.id, total, txs)?
                    }
                    Counterparty::Candidate(receiver) => {
                        post_receive(&mut receiver.direct, counterparty_due, &filer_id, amount, memo);
                        // The candidate's direct receipts mix both natures; each
                        // slot tracks only its own.
                        let slot = if transfer {
                            RankingSlot::TransferRecipients
                        } else {
                            RankingSlot::ExpenseRecipients
                        };
                        self.rank_running(filer_due, filer, slot, &receiver.id, amount)?
                    }
                    Counterparty::Committee(receiver_id) => {
                        self.rank_running(filer_due, filer, RankingSlot::TransferRecipients, receiver_id, amount)?
                    }
                }
            }
        };

        Ok(match admission {
            Some(admission) => Applied::Posted(admission),
            None => Applied::Completed,
        })
    }

    /// Looks both parties up in the batch cache and applies `tx`.
    pub fn apply_in_cache(
        &self,
        tx: &Transaction,
        counterparty_kind: EntityKind,
        cache: &mut BatchCache,
    ) -> Result<Applied> {
        let mut filer = match cache.take(&tx.filer_id)? {
            Entity::Committee(ledger) => ledger,
            other => {
                let found = other.kind();
                cache.restore(other);
                return Err(AggregationError::UnexpectedEntityKind {
                    id: tx.filer_id.clone(),
                    expected: EntityKind::Committee.to_string(),
                    found: found.to_string(),
                });
            }
        };

        let outcome = self.apply_with_counterparty(tx, counterparty_kind, &mut filer, cache);
        cache.restore(Entity::Committee(filer));
        outcome
    }

    fn apply_with_counterparty(
        &self,
        tx: &Transaction,
        expected: EntityKind,
        filer: &mut CommitteeLedger,
        cache: &mut BatchCache,
    ) -> Result<Applied> {
        if expected == EntityKind::Committee {
            return self.apply(tx, filer, Counterparty::Committee(&tx.counterparty_id));
        }

        let entity = cache
            .get_mut(&tx.counterparty_id)
            .ok_or_else(|| AggregationError::MissingEntity(tx.counterparty_id.clone()))?;
        let counterparty = match (expected, entity) {
            (EntityKind::Individual, Entity::Individual(e)) => Counterparty::Individual(e),
            (EntityKind::Organization, Entity::Organization(e)) => Counterparty::Organization(e),
            (EntityKind::Candidate, Entity::Candidate(e)) => Counterparty::Candidate(e),
            (expected, other) => {
                return Err(AggregationError::UnexpectedEntityKind {
                    id: tx.counterparty_id.clone(),
                    expected: expected.to_string(),
                    found: other.kind().to_string(),
                })
            }
        };
        self.apply(tx, filer, counterparty)
    }

    fn rank(
        &self,
        due: bool,
        filer: &mut CommitteeLedger,
        slot: RankingSlot,
        id: &str,
        total: f32,
        txs: u32,
    ) -> Result<Option<Admission>> {
        if !due {
            return Ok(None);
        }
        filer
            .ranking_mut(slot)
            .admit(id, total, txs, &self.bounds)
            .map(Some)
    }

    /// For counterparties without a per-slot map of their own, the running
    /// total is whatever the filer's ranking already holds plus `amount`.
    fn rank_running(
        &self,
        due: bool,
        filer: &mut CommitteeLedger,
        slot: RankingSlot,
        id: &str,
        amount: f32,
    ) -> Result<Option<Admission>> {
        let ranking = filer.ranking(slot);
        let total = ranking.amount(id).unwrap_or(0.0) + amount;
        let txs = ranking.txs.get(id).copied().unwrap_or(0) + 1;
        self.rank(due, filer, slot, id, total, txs)
    }
}

fn post_send(ledger: &mut DonorLedger, due: bool, committee: &str, amount: f32, memo: bool) -> (f32, u32) {
    if due {
        ledger.send(committee, amount, memo)
    } else {
        ledger.sent_to(committee)
    }
}

fn post_receive(ledger: &mut DonorLedger, due: bool, committee: &str, amount: f32, memo: bool) -> (f32, u32) {
    if due {
        ledger.receive(committee, amount, memo)
    } else {
        ledger.received_from(committee)
    }
}
