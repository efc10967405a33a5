use crate::error::{AggregationError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Half-open range `[from, until)` over zero-padded FEC transaction-type codes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct CodeRange {
    #[schemars(description = "Inclusive lower bound, compared as a string (e.g. \"30\").")]
    pub from: String,

    #[schemars(description = "Exclusive upper bound, compared as a string (e.g. \"33\").")]
    pub until: String,
}

impl CodeRange {
    pub fn new(from: &str, until: &str) -> Self {
        Self {
            from: from.to_string(),
            until: until.to_string(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        code >= self.from.as_str() && code < self.until.as_str()
    }
}

/// Classification data for FEC transaction-type codes.
///
/// Kept as configuration so the code lists can change between election
/// cycles without touching the ledger engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TxTypeTable {
    #[schemars(description = "Code ranges that are money received by the filer. Everything else is outgoing.")]
    pub incoming: Vec<CodeRange>,

    #[schemars(
        description = "Incoming code ranges booked as other receipts (loans, refunds, offsets) instead of contributions."
    )]
    pub other_receipts: Vec<CodeRange>,

    #[schemars(description = "Codes that are transfers between committees rather than expenses.")]
    pub transfers: BTreeSet<String>,

    #[schemars(description = "Earmark codes: the counterparty is always resolved from the identity fields.")]
    pub earmarks: BTreeSet<String>,

    #[schemars(description = "Memo code value marking an informational sub-entry.")]
    pub memo_flag: String,
}

impl Default for TxTypeTable {
    fn default() -> Self {
        let transfers = [
            "15Z", "16R", "17R", "18G", "18J", "18K", "19J", "22H", "22Z", "24G", "24H", "24K",
            "24U", "24Z", "24I", "24T", "30K", "30G", "30F", "31K", "31G", "31F", "32K", "32G",
            "32F", "40Z", "41Z", "42Z",
        ];
        let earmarks = ["15E", "15I", "15T", "24I"];

        Self {
            incoming: vec![CodeRange::new("", "20"), CodeRange::new("30", "33")],
            other_receipts: vec![CodeRange::new("16", "18")],
            transfers: transfers.iter().map(|c| c.to_string()).collect(),
            earmarks: earmarks.iter().map(|c| c.to_string()).collect(),
            memo_flag: "X".to_string(),
        }
    }
}

impl TxTypeTable {
    pub fn is_earmark(&self, code: &str) -> bool {
        self.earmarks.contains(code)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct RankingBounds {
    #[schemars(description = "Maximum number of entries kept in each per-entity top contributor/recipient map.")]
    pub top_k: usize,

    #[schemars(
        description = "How many of the smallest ranked entries are cached as the admission threshold. Must be between 1 and top_k."
    )]
    pub threshold_window: usize,
}

impl Default for RankingBounds {
    fn default() -> Self {
        Self {
            top_k: 100,
            threshold_window: 10,
        }
    }
}

impl RankingBounds {
    pub fn new(top_k: usize, threshold_window: usize) -> Self {
        Self {
            top_k,
            threshold_window,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold_window == 0 || self.threshold_window > self.top_k {
            return Err(AggregationError::InvalidConfig(format!(
                "threshold_window {} must be between 1 and top_k {}",
                self.threshold_window, self.top_k
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TopOverallLimits {
    #[schemars(description = "Size of committee and candidate top-overall rankings.")]
    pub default_limit: usize,

    #[schemars(description = "Size of the individual donor/recipient top-overall rankings.")]
    pub individuals_limit: usize,
}

impl Default for TopOverallLimits {
    fn default() -> Self {
        Self {
            default_limit: 500,
            individuals_limit: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct RetryPolicy {
    #[schemars(description = "Base wait in milliseconds; attempt n waits base * 2^n.")]
    pub base_ms: u64,

    #[schemars(description = "Ceiling on the cumulative wait in milliseconds before giving up.")]
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 50,
            cap_ms: 60_000,
        }
    }
}

/// Bulk files for one dataset year. Any kind may be omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DatasetFiles {
    #[serde(default)]
    pub candidates: Option<PathBuf>,
    #[serde(default)]
    pub committees: Option<PathBuf>,
    #[serde(default)]
    pub committee_financials: Option<PathBuf>,
    #[serde(default)]
    #[schemars(description = "Committee-to-committee transactions (itpas2/itoth).")]
    pub committee_contributions: Vec<PathBuf>,
    #[serde(default)]
    #[schemars(description = "Individual contributions (itcont).")]
    pub individual_contributions: Option<PathBuf>,
    #[serde(default)]
    #[schemars(description = "Operating expenditures (oppexp).")]
    pub disbursements: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AggregationConfig {
    #[schemars(description = "Dataset selector, usually the election cycle year (e.g. \"2020\").")]
    pub year: String,

    #[serde(default = "default_batch_size")]
    #[schemars(description = "Records parsed and committed per batch.")]
    pub batch_size: usize,

    #[serde(default)]
    pub ranking: RankingBounds,

    #[serde(default)]
    pub top_overall: TopOverallLimits,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub tx_types: TxTypeTable,

    #[serde(default)]
    pub inputs: DatasetFiles,

    #[serde(default = "default_state_dir")]
    #[schemars(description = "Directory holding checkpoints, the identity index and stored objects.")]
    pub state_dir: PathBuf,

    #[serde(default = "default_verify_ledgers")]
    #[schemars(description = "Audit every touched committee ledger before a batch is committed.")]
    pub verify_ledgers: bool,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("db")
}

fn default_verify_ledgers() -> bool {
    true
}

impl AggregationConfig {
    pub fn new(year: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            batch_size: default_batch_size(),
            ranking: RankingBounds::default(),
            top_overall: TopOverallLimits::default(),
            retry: RetryPolicy::default(),
            tx_types: TxTypeTable::default(),
            inputs: DatasetFiles::default(),
            state_dir: default_state_dir(),
            verify_ledgers: default_verify_ledgers(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AggregationConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.year.trim().is_empty() {
            return Err(AggregationError::InvalidConfig(
                "year must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AggregationError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        self.ranking.validate()?;

        let overall = RankingBounds::new(
            self.top_overall.default_limit.min(self.top_overall.individuals_limit),
            self.ranking.threshold_window,
        );
        overall.validate().map_err(|_| {
            AggregationError::InvalidConfig(format!(
                "top_overall limits must be at least threshold_window {}",
                self.ranking.threshold_window
            ))
        })?;

        if self.retry.cap_ms < self.retry.base_ms {
            return Err(AggregationError::InvalidConfig(format!(
                "retry cap {}ms is below the base wait {}ms",
                self.retry.cap_ms, self.retry.base_ms
            )));
        }
        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(AggregationConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let schema_json = AggregationConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("batch_size"));
        assert!(schema_json.contains("threshold_window"));
        assert!(schema_json.contains("tx_types"));
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: AggregationConfig = serde_json::from_str(r#"{ "year": "2020" }"#).unwrap();
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.ranking, RankingBounds::default());
        assert_eq!(config.tx_types.memo_flag, "X");
        assert!(config.verify_ledgers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_larger_than_bound_is_rejected() {
        let mut config = AggregationConfig::new("2020");
        config.ranking = RankingBounds::new(3, 5);
        assert!(matches!(
            config.validate(),
            Err(AggregationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut config = AggregationConfig::new("2020");
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_code_range_compares_as_strings() {
        let table = TxTypeTable::default();
        assert!(table.incoming[0].contains("15E"));
        assert!(!table.incoming[0].contains("24K"));
        assert!(table.incoming[1].contains("32K"));
        assert!(!table.incoming[1].contains("33"));
        assert!(table.other_receipts[0].contains("17R"));
        assert!(!table.other_receipts[0].contains("18G"));
        assert!(table.is_earmark("15E"));
    }
}
