use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Pool timeout: {0}")]
    PoolTimeout(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("Invalid savepoint: {0}")]
    InvalidSavepoint(String),

    #[error("Transaction timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
