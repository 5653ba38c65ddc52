use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate occurrence key: {0}")]
    DuplicateOccurrenceKey(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Background task failed: {0}")]
    Task(String),
}
