// ============================================================================
// txcoord Library
// ============================================================================
//
// Transaction orchestration over pluggable database sessions: atomic units of
// work, savepoints, deadlock retry, batch/parallel execution and health probes.
// Ships an in-memory transactional provider used for tests and examples.
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod interface;
pub mod result;
pub mod storage;
pub mod transaction;

pub use core::{DbError, Result};
pub use interface::{PoolStats, Session, SessionProvider};
pub use result::{QueryResult, Row};

// In-memory provider
pub use connection::{
    MemoryData, MemorySession,
    config::ConnectionConfig,
    pool::MemoryPool,
};
pub use storage::InMemoryStorage;

pub use transaction::{
    BoxedWork, ContentionKind, LockContention, RetryPolicy, TracingLog, TransactionConfig,
    TransactionCoordinator, TransactionId, TransactionLog, TransactionScope, classify_message,
    unit_of_work,
};
