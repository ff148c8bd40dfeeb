use async_trait::async_trait;
use crate::core::Result;
use crate::result::QueryResult;

/// An active database connection, bound to zero or one open transaction.
///
/// A session is owned by exactly one logical transaction at a time. The
/// coordinator drives it through `connect -> begin -> commit|rollback -> release`;
/// code outside the coordinator only ever sees it through a
/// [`TransactionScope`](crate::transaction::TransactionScope) or, for manual
/// control, through [`create_session_handle`](crate::TransactionCoordinator::create_session_handle).
#[async_trait]
pub trait Session: Send {
    /// Data-access context handed through to units of work.
    type Data: Send;

    /// Establish connectivity. No transaction is opened.
    async fn connect(&mut self) -> Result<()>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Return the session to its provider. Called exactly once per acquired session
    /// by the coordinator.
    async fn release(&mut self) -> Result<()>;

    /// Execute a raw statement on this session (savepoints, probes, driver SQL).
    async fn query(&mut self, statement: &str) -> Result<QueryResult>;

    /// Whether a top-level transaction is currently open.
    fn is_transaction_active(&self) -> bool;

    fn data(&mut self) -> &mut Self::Data;
}

/// Source of sessions. Pooling, authentication and dialect live behind this trait.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    type Session: Session;

    async fn create_session(&self) -> Result<Self::Session>;

    /// Provider-level statement outside any session, used for liveness probes.
    async fn query(&self, statement: &str) -> Result<QueryResult>;

    /// Whether the provider is ready to hand out sessions.
    fn is_initialized(&self) -> bool;

    /// Pool statistics, for providers that track them.
    async fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub total_acquired: u64,
    pub total_released: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} acquired, {} released",
            self.active_connections,
            self.max_connections,
            self.total_acquired,
            self.total_released
        )
    }
}
