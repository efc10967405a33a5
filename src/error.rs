use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Identity index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Unexpected entity kind for {id}: expected {expected}, found {found}")]
    UnexpectedEntityKind {
        id: String,
        expected: String,
        found: String,
    },

    #[error("Entity {0} is not present in the batch cache")]
    MissingEntity(String),

    #[error("Threshold window needs {required} entries but the ranking holds {available}")]
    ThresholdUnderflow { required: usize, available: usize },

    #[error("Max retries reached after {attempts} attempts: {last_error}")]
    MaxRetriesReached { attempts: u32, last_error: String },

    #[error("Ledger imbalance for {id}: {details}")]
    LedgerImbalance { id: String, details: String },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AggregationError>;
