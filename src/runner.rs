//! Drives bulk files through parse, resolve, apply and commit, one batch at
//! a time, resuming from the last committed offset of each file.

use crate::audit::LedgerAuditor;
use crate::checkpoint::{CheckpointStore, DatasetKey, FileCheckpointStore};
use crate::engine::{Applied, LedgerEngine, Transaction};
use crate::entities::{counterparty_kind, Candidate, CommitteeLedger, Entity, EntityKind};
use crate::error::Result;
use crate::index::{IdentityIndex, JsonFileIndex};
use crate::parser::{parse_batch, FecRecord};
use crate::persist::PersistenceGateway;
use crate::rankings::{build_secondary, SecondaryDatasets};
use crate::records::{
    CandidateRecord, CmteFinancials, CommitteeRecord, Contribution, Disbursement, RecordKind,
};
use crate::resolver::{BatchCache, EntityResolver, Identity};
use crate::schema::{AggregationConfig, TxTypeTable};
use crate::store::{Bucket, JsonFileStore, ObjectStore, ObjectStoreExt};
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tolerance used when auditing ledgers before commit.
const AUDIT_TOLERANCE: f32 = 0.01;

const EARMARK_PASS_THROUGH: &str = "24I";
const EARMARK_RECEIPT: &str = "15E";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub records: usize,
    pub posted: usize,
    /// Rows replayed only for the counterparty a partial commit left behind.
    pub completed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub objects: usize,
    pub final_offset: u64,
    pub stopped: bool,
}

impl RunSummary {
    fn absorb(&mut self, other: &RunSummary) {
        self.batches += other.batches;
        self.records += other.records;
        self.posted += other.posted;
        self.completed += other.completed;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.objects += other.objects;
        self.stopped |= other.stopped;
    }
}

/// A pass-through earmark is booked as an earmarked receipt of the
/// committee it was passed to. Without a recipient it stays with the filer.
pub fn normalize_earmark(cont: &mut Contribution) {
    if cont.tx_type.trim() != EARMARK_PASS_THROUGH {
        return;
    }
    if cont.other_id.trim().is_empty() {
        warn!(
            "Earmark {} has no recipient; booking it with filer {}",
            cont.tx_id, cont.cmte_id
        );
    } else {
        cont.cmte_id = cont.other_id.trim().to_string();
    }
    cont.tx_type = EARMARK_RECEIPT.to_string();
}

/// Identity of the non-filing party of a contribution row.
pub fn contribution_counterparty<'r>(cont: &'r Contribution, table: &TxTypeTable) -> Identity<'r> {
    let earmarked = table.is_earmark(cont.tx_type.trim());
    let other_id = if earmarked { "" } else { cont.other_id.trim() };

    match counterparty_kind(other_id, &cont.occupation) {
        EntityKind::Committee => Identity::Committee(other_id),
        EntityKind::Candidate => Identity::Candidate(other_id),
        EntityKind::Individual => Identity::Person {
            name: &cont.name,
            employer: &cont.employer,
            occupation: &cont.occupation,
            zip: &cont.zip,
            city: &cont.city,
            state: &cont.state,
        },
        EntityKind::Organization => Identity::Organization {
            name: &cont.name,
            zip: &cont.zip,
            city: &cont.city,
            state: &cont.state,
        },
    }
}

pub struct BatchRunner<'a> {
    config: &'a AggregationConfig,
    store: &'a dyn ObjectStore,
    index: &'a dyn IdentityIndex,
    checkpoints: &'a dyn CheckpointStore,
    stop: Arc<AtomicBool>,
    sleep: fn(Duration),
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        config: &'a AggregationConfig,
        store: &'a dyn ObjectStore,
        index: &'a dyn IdentityIndex,
        checkpoints: &'a dyn CheckpointStore,
    ) -> Self {
        Self {
            config,
            store,
            index,
            checkpoints,
            stop: Arc::new(AtomicBool::new(false)),
            sleep: std::thread::sleep,
        }
    }

    /// Shares a stop flag; the runner finishes its current batch and returns.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_sleeper(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Checkpoint key of one input file: the record kind plus the file stem,
    /// so several files of the same kind resume independently.
    pub fn dataset_key<R: FecRecord>(&self, path: &Path) -> DatasetKey {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        DatasetKey::new(
            self.config.year.as_str(),
            format!("{}_{}", R::KIND.checkpoint_label(), stem),
        )
    }

    fn gateway(&self) -> PersistenceGateway<'a> {
        PersistenceGateway::new(
            self.config.year.as_str(),
            self.store,
            self.index,
            self.checkpoints,
            self.config.retry,
        )
        .with_sleeper(self.sleep)
    }

    fn run_file<R, F>(&self, path: &Path, mut handle: F) -> Result<RunSummary>
    where
        R: FecRecord,
        F: FnMut(Vec<(u64, R)>, &mut BatchCache, &mut PersistenceGateway<'a>, &mut RunSummary) -> Result<()>,
    {
        let key = self.dataset_key::<R>(path);
        let mut reader = BufReader::new(File::open(path)?);
        let mut offset = self.checkpoints.get_offset(&key)?;
        let mut gateway = self.gateway();
        let auditor = LedgerAuditor::new(self.config.ranking, AUDIT_TOLERANCE);
        let mut summary = RunSummary {
            final_offset: offset,
            ..Default::default()
        };

        info!("Processing {} from offset {}", key, offset);
        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested; {} halted at offset {}", key, offset);
                summary.stopped = true;
                break;
            }

            let batch = parse_batch::<R, _>(&mut reader, offset, self.config.batch_size)?;
            if batch.records.is_empty() {
                break;
            }
            let rows = batch.records.len();
            let located: Vec<(u64, R)> = batch.offsets.into_iter().zip(batch.records).collect();

            let mut cache = BatchCache::new();
            handle(located, &mut cache, &mut gateway, &mut summary)?;
            cache.advance_watermarks(&key.kind, batch.next_offset);
            if self.config.verify_ledgers {
                auditor.audit_batch(&cache)?;
            }
            let committed = gateway.commit(&cache, &key, batch.next_offset)?;

            offset = batch.next_offset;
            summary.batches += 1;
            summary.records += rows;
            summary.objects += committed.objects;
            summary.final_offset = offset;
            debug!("{}: committed {} rows through offset {}", key, rows, offset);

            if batch.exhausted {
                break;
            }
        }

        info!(
            "{}: {} rows in {} batches, {} posted, {} completed, {} duplicates, {} skipped",
            key,
            summary.records,
            summary.batches,
            summary.posted,
            summary.completed,
            summary.duplicates,
            summary.skipped
        );
        Ok(summary)
    }

    /// Candidate registrations. Direct totals of known candidates are kept.
    pub fn run_candidates(&self, path: &Path) -> Result<RunSummary> {
        let year = self.config.year.as_str();
        self.run_file::<CandidateRecord, _>(path, |records, cache, _, _| {
            for (_, record) in records {
                if let Some(Entity::Candidate(existing)) = cache.get_mut(&record.id) {
                    existing.refresh_registration(&record);
                    continue;
                }
                match self.store.get_entity(year, EntityKind::Candidate, &record.id)? {
                    Some(Entity::Candidate(mut existing)) => {
                        existing.refresh_registration(&record);
                        cache.insert(Entity::Candidate(existing), false);
                    }
                    _ => cache.insert(Entity::Candidate(Candidate::from_record(&record)), true),
                }
            }
            Ok(())
        })
    }

    /// Committee registrations, plus an empty transaction ledger for every
    /// committee that does not have one yet.
    pub fn run_committees(&self, path: &Path) -> Result<RunSummary> {
        let year = self.config.year.as_str();
        self.run_file::<CommitteeRecord, _>(path, |records, cache, gateway, summary| {
            for (_, record) in &records {
                if let Some(Entity::Committee(existing)) = cache.get_mut(&record.id) {
                    existing.refresh_registration(record);
                    continue;
                }
                match self.store.get_entity(year, EntityKind::Committee, &record.id)? {
                    Some(Entity::Committee(mut existing)) => {
                        existing.refresh_registration(record);
                        cache.insert(Entity::Committee(existing), false);
                    }
                    _ => cache.insert(
                        Entity::Committee(CommitteeLedger::for_committee(record)),
                        true,
                    ),
                }
            }
            let registrations: Vec<(String, CommitteeRecord)> = records
                .into_iter()
                .map(|(_, record)| (record.id.clone(), record))
                .collect();
            summary.objects += gateway.put_objects(Bucket::Committees, &registrations)?;
            Ok(())
        })
    }

    /// Financial summaries are stored as filed.
    pub fn run_committee_financials(&self, path: &Path) -> Result<RunSummary> {
        self.run_file::<CmteFinancials, _>(path, |records, _, gateway, summary| {
            let items: Vec<(String, CmteFinancials)> = records
                .into_iter()
                .filter(|(_, fin)| !fin.cmte_id.is_empty())
                .map(|(_, fin)| (fin.cmte_id.clone(), fin))
                .collect();
            summary.objects += gateway.put_objects(Bucket::CmteFinancials, &items)?;
            Ok(())
        })
    }

    pub fn run_contributions(&self, path: &Path) -> Result<RunSummary> {
        let year = self.config.year.as_str();
        let table = &self.config.tx_types;
        let resolver = EntityResolver::new(year, self.index, self.store);
        let engine = LedgerEngine::new(self.config.ranking)
            .for_input(self.dataset_key::<Contribution>(path).kind);

        self.run_file::<Contribution, _>(path, |records, cache, _, summary| {
            for (offset, mut cont) in records {
                normalize_earmark(&mut cont);
                if cont.cmte_id.trim().is_empty() {
                    warn!("Skipping contribution {} without a filer", cont.tx_id);
                    summary.skipped += 1;
                    continue;
                }

                resolver.resolve_committee(cache, &cont.cmte_id)?;
                let counterparty = resolver.resolve(cache, &contribution_counterparty(&cont, table))?;

                let tx = Transaction::from_contribution(&cont, counterparty.id, table).at_offset(offset);
                record_outcome(summary, engine.apply_in_cache(&tx, counterparty.kind, cache)?);
            }
            Ok(())
        })
    }

    /// Operating expenditures; the payee is always resolved as an organization.
    pub fn run_disbursements(&self, path: &Path) -> Result<RunSummary> {
        let year = self.config.year.as_str();
        let table = &self.config.tx_types;
        let resolver = EntityResolver::new(year, self.index, self.store);
        let engine = LedgerEngine::new(self.config.ranking)
            .for_input(self.dataset_key::<Disbursement>(path).kind);

        self.run_file::<Disbursement, _>(path, |records, cache, _, summary| {
            for (offset, disb) in records {
                if disb.cmte_id.trim().is_empty() {
                    warn!("Skipping disbursement {} without a filer", disb.tx_id);
                    summary.skipped += 1;
                    continue;
                }

                resolver.resolve_committee(cache, &disb.cmte_id)?;
                let payee = resolver.resolve(
                    cache,
                    &Identity::Organization {
                        name: &disb.name,
                        zip: &disb.zip,
                        city: &disb.city,
                        state: &disb.state,
                    },
                )?;

                let tx = Transaction::from_disbursement(&disb, payee.id, table).at_offset(offset);
                record_outcome(summary, engine.apply_in_cache(&tx, payee.kind, cache)?);
            }
            Ok(())
        })
    }

    /// Runs every configured input in dependency order: registrations before
    /// the transactions that reference them.
    pub fn run_all(&self) -> Result<RunSummary> {
        let inputs = &self.config.inputs;
        let mut total = RunSummary::default();

        let mut steps: Vec<(&Path, RecordKind)> = Vec::new();
        if let Some(path) = &inputs.candidates {
            steps.push((path.as_path(), RecordKind::Candidate));
        }
        if let Some(path) = &inputs.committees {
            steps.push((path.as_path(), RecordKind::Committee));
        }
        if let Some(path) = &inputs.committee_financials {
            steps.push((path.as_path(), RecordKind::CommitteeFinancials));
        }
        for path in &inputs.committee_contributions {
            steps.push((path.as_path(), RecordKind::Contribution));
        }
        if let Some(path) = &inputs.individual_contributions {
            steps.push((path.as_path(), RecordKind::Contribution));
        }
        if let Some(path) = &inputs.disbursements {
            steps.push((path.as_path(), RecordKind::Disbursement));
        }

        for (path, kind) in steps {
            let summary = match kind {
                RecordKind::Candidate => self.run_candidates(path)?,
                RecordKind::Committee => self.run_committees(path)?,
                RecordKind::CommitteeFinancials => self.run_committee_financials(path)?,
                RecordKind::Contribution => self.run_contributions(path)?,
                RecordKind::Disbursement => self.run_disbursements(path)?,
            };
            total.absorb(&summary);
            if summary.stopped {
                break;
            }
        }
        Ok(total)
    }

    /// Builds and stores the top-overall rankings and yearly totals.
    pub fn run_secondary(&self) -> Result<SecondaryDatasets> {
        let datasets = build_secondary(self.store, self.config)?;
        let mut gateway = self.gateway();

        let rankings: Vec<(String, _)> = datasets
            .rankings
            .iter()
            .map(|(id, data)| (id.clone(), data))
            .collect();
        gateway.put_objects(Bucket::TopOverall, &rankings)?;

        let totals: Vec<(String, _)> = datasets
            .totals
            .iter()
            .map(|(id, total)| (id.clone(), total))
            .collect();
        gateway.put_objects(Bucket::YearlyTotals, &totals)?;
        Ok(datasets)
    }
}

fn record_outcome(summary: &mut RunSummary, applied: Applied) {
    match applied {
        Applied::Posted(_) => summary.posted += 1,
        Applied::Completed => summary.completed += 1,
        Applied::Duplicate => summary.duplicates += 1,
    }
}

/// Processes every input of `config` against file-backed state under
/// `config.state_dir`, then rebuilds the secondary rankings.
pub fn process_dataset(config: &AggregationConfig) -> Result<RunSummary> {
    config.validate()?;
    let state = &config.state_dir;
    let checkpoints = FileCheckpointStore::open(state.join("checkpoints"))?;
    let index = JsonFileIndex::open(state.join("index"))?;
    let store = JsonFileStore::open(state.join("objects"))?;

    let runner = BatchRunner::new(config, &store, &index, &checkpoints);
    let summary = runner.run_all()?;
    if summary.stopped {
        return Ok(summary);
    }
    let secondary = runner.run_secondary()?;
    info!(
        "Dataset {} done: {} rows, {} rankings",
        config.year,
        summary.records,
        secondary.rankings.len()
    );
    Ok(summary)
}
