use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CORRUPT_SNAPSHOT: {0}")]
    CorruptSnapshot(String),
    /// Atomic write aborted, including a lost race on a concurrent save. The
    /// caller re-reads and retries.
    #[error("TRANSACTION_FAILED: {0}")]
    Transaction(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Only an aborted transaction is safe to retry; the live document is untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
