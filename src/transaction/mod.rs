// ============================================================================
// Transaction Coordination Module
// ============================================================================
//
// Runs units of work against sessions from a SessionProvider:
// - coordinator: acquire / begin / commit or rollback / release lifecycle
// - savepoint:   partial rollback inside an open transaction
// - retry:       re-run on deadlock or lock wait timeout, exponential backoff
// - executor:    sequential batch (one transaction) and parallel (one each)
// - health:      liveness probe and session diagnostics
//
// ============================================================================

pub mod coordinator;
pub mod executor;
pub mod health;
pub mod id;
pub mod log;
pub mod policy;
pub mod retry;
pub mod savepoint;
pub mod scope;

pub use coordinator::TransactionCoordinator;
pub use executor::{BoxedWork, unit_of_work};
pub use id::TransactionId;
pub use log::{TracingLog, TransactionLog};
pub use policy::{RetryPolicy, TransactionConfig};
pub use retry::{CONTENTION_SIGNATURES, ContentionKind, LockContention, classify_message};
pub use savepoint::{generate_savepoint_name, validate_savepoint_name};
pub use scope::TransactionScope;
