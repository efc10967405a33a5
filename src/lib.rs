//! # FEC Ledger Builder
//!
//! A library for aggregating the FEC bulk files of one election cycle into
//! per-entity ledgers: committee transaction totals, donor and recipient
//! balances, and bounded top-contributor rankings.
//!
//! ## Core Concepts
//!
//! - **Resumable parsing**: bulk files are read in batches from a byte offset;
//!   the offset is checkpointed only after the batch's ledgers are persisted
//! - **Entity resolution**: donors without an FEC ID are identified by a
//!   content hash of their identity fields and remembered in a secondary index
//! - **Ledger engine**: each transaction updates the filing committee and the
//!   counterparty, skipping the side whose stored watermark already covers
//!   the row's byte offset
//! - **Top-K rankings**: each ranking keeps at most `top_k` entries and a small
//!   window of its smallest entries as the admission threshold
//! - **Secondary rankings**: dataset-wide top lists and yearly totals by party
//! - **Cross-year views**: stored ledgers of several cycles merged on read, and
//!   donor ownership shares of a committee's contributions
//!
//! ## Example
//!
//! ```rust,ignore
//! use fec_ledger_builder::*;
//! use std::path::PathBuf;
//!
//! let mut config = AggregationConfig::new("2020");
//! config.inputs.committees = Some(PathBuf::from("bulk/cm.txt"));
//! config.inputs.individual_contributions = Some(PathBuf::from("bulk/itcont.txt"));
//! config.state_dir = PathBuf::from("db");
//!
//! let summary = process_dataset(&config).unwrap();
//! println!("{} rows posted", summary.posted);
//! ```

pub mod audit;
pub mod backoff;
pub mod checkpoint;
pub mod engine;
pub mod entities;
pub mod error;
pub mod idhash;
pub mod index;
pub mod merge;
pub mod ownership;
pub mod parser;
pub mod persist;
pub mod rankings;
pub mod records;
pub mod resolver;
pub mod runner;
pub mod schema;
pub mod store;
pub mod topk;
pub mod utils;

pub use audit::LedgerAuditor;
pub use backoff::ExponentialBackoff;
pub use checkpoint::{CheckpointStore, DatasetKey, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{classify, Applied, Counterparty, Direction, LedgerEngine, Nature, Transaction, TxClass};
pub use entities::{
    Candidate, Committee, CommitteeLedger, DonorLedger, Entity, EntityKind, Individual,
    Organization, RankingSlot, Watermarks,
};
pub use error::{AggregationError, Result};
pub use idhash::{new_hash, organization_id, person_id};
pub use index::{IdentityIndex, IndexEntry, IndexSpace, JsonFileIndex, MemoryIndex};
pub use merge::{merge_indexed, merge_years};
pub use ownership::{direct_share, total_share};
pub use parser::{parse_batch, FecRecord, ParsedBatch};
pub use persist::{CommitSummary, PersistenceGateway};
pub use rankings::{build_secondary, Category, Party, SecondaryDatasets, TopOverallData, YearlyTotal};
pub use records::*;
pub use resolver::{BatchCache, EntityResolver, Identity, Resolution};
pub use runner::{process_dataset, BatchRunner, RunSummary};
pub use schema::*;
pub use store::{Bucket, JsonFileStore, MemoryStore, ObjectStore, ObjectStoreExt, Page};
pub use topk::{Admission, Entry, Ranking, ThresholdWindow};
