use smelt_runtime::RuntimeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Fatal configuration problem, raised before any work starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Normalization or validation-case loading produced zero usable units.
    #[error("no data found: {0}")]
    NoData(String),

    /// An unparseable dataset file or grader output.
    ///
    /// Recoverable by policy: callers log it and skip the offending unit
    /// (or count a failed evaluation) instead of propagating it across a
    /// component boundary.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
