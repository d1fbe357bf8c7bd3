use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum WhereError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WhereError {
    /// Deadline expiry is an expected outcome of a refresh cycle, not a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WhereError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, WhereError>;
