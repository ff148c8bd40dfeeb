use super::{MemorySession, config::ConnectionConfig, statement::{Statement, parse_statement}};
use crate::core::{DbError, Result};
use crate::interface::{PoolStats, SessionProvider};
use crate::result::QueryResult;
use crate::storage::InMemoryStorage;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{Level, event};

/// State shared between the pool and the sessions it handed out
pub(crate) struct PoolShared {
    config: ConnectionConfig,
    storage: Arc<InMemoryStorage>,
    /// Sessions currently checked out
    active: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    initialized: AtomicBool,
    next_id: AtomicU64,
}

impl PoolShared {
    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> Arc<InMemoryStorage> {
        Arc::clone(&self.storage)
    }

    pub(crate) fn release_slot(&self, session_id: u64) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
        event!(Level::DEBUG, session = session_id, "session returned to pool");
    }

    /// Claim a slot if one is free
    fn try_claim_slot(&self) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.config.max_connections).then_some(active + 1)
            })
            .is_ok()
    }
}

/// Connection pool over an in-memory transactional store
///
/// Implements [`SessionProvider`], so it can back a
/// [`TransactionCoordinator`](crate::TransactionCoordinator) directly.
///
/// # Examples
///
/// ```
/// use txcoord::{ConnectionConfig, MemoryPool, SessionProvider};
///
/// # #[tokio::main]
/// # async fn main() -> txcoord::Result<()> {
/// let pool = MemoryPool::new(ConnectionConfig::new("billing").max_connections(4))?;
/// assert!(pool.is_initialized());
///
/// let result = pool.query("SELECT 1").await?;
/// assert_eq!(result.row_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create a pool over a fresh store
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::new_with_storage(config, Arc::new(InMemoryStorage::new()))
    }

    /// Create a pool over an existing store
    pub fn new_with_storage(config: ConnectionConfig, storage: Arc<InMemoryStorage>) -> Result<Self> {
        config.validate().map_err(DbError::ConnectionError)?;

        event!(
            Level::INFO,
            database = %config.database,
            max_connections = config.max_connections,
            "memory pool initialized"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                storage,
                active: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                initialized: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Check out a session, waiting up to `connect_timeout` for a free slot
    pub async fn get_session(&self) -> Result<MemorySession> {
        let start = Instant::now();

        loop {
            if !self.is_initialized() {
                return Err(DbError::ConnectionError("Pool is closed".into()));
            }

            if self.shared.try_claim_slot() {
                let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                self.shared.acquired.fetch_add(1, Ordering::SeqCst);
                event!(Level::DEBUG, session = id, "session acquired from pool");
                return Ok(MemorySession::new(id, Arc::clone(&self.shared)));
            }

            if start.elapsed() >= self.shared.config.connect_timeout {
                return Err(DbError::PoolTimeout(format!(
                    "no session available within {}ms ({} max)",
                    self.shared.config.connect_timeout.as_millis(),
                    self.shared.config.max_connections
                )));
            }

            tokio::time::sleep(self.shared.config.lock_poll_interval).await;
        }
    }

    /// Stop handing out sessions. Sessions already checked out keep working.
    pub fn close(&self) {
        self.shared.initialized.store(false, Ordering::SeqCst);
        event!(Level::INFO, database = %self.shared.config.database, "memory pool closed");
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.shared.active.load(Ordering::SeqCst),
            max_connections: self.shared.config.max_connections,
            total_acquired: self.shared.acquired.load(Ordering::SeqCst),
            total_released: self.shared.released.load(Ordering::SeqCst),
        }
    }

    /// The committed store behind this pool
    pub fn storage(&self) -> Arc<InMemoryStorage> {
        self.shared.storage()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

#[async_trait]
impl SessionProvider for MemoryPool {
    type Session = MemorySession;

    async fn create_session(&self) -> Result<MemorySession> {
        self.get_session().await
    }

    async fn query(&self, statement: &str) -> Result<QueryResult> {
        if !self.is_initialized() {
            return Err(DbError::ConnectionError("Pool is closed".into()));
        }

        match parse_statement(statement)? {
            Statement::SelectLiterals(result) => Ok(result),
            _ => Err(DbError::UnsupportedOperation(
                "Transaction control requires a session".into(),
            )),
        }
    }

    fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    async fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.stats())
    }
}
