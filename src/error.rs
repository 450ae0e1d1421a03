use thiserror::Error;

/// Fatal error classes for a benchmark run.
///
/// Recoverable conditions (skipped lines, unmatched unbans, non-monotonic
/// timestamps) are not errors; they are counted in
/// [`crate::models::RunWarnings`] and reported alongside the results.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Process exit code for this error class.
    ///
    /// Configuration problems exit 2, unreadable structured inputs exit 3,
    /// a mid-run emission failure exits 4, everything else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Configuration(_) => 2,
            BenchError::DataFormat(_) => 3,
            BenchError::SinkWrite(_) => 4,
            BenchError::Io(_) | BenchError::Json(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
