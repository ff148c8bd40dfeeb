use super::coordinator::TransactionCoordinator;
use crate::interface::{PoolStats, Session, SessionProvider};
use tracing::Level;

impl<P: SessionProvider> TransactionCoordinator<P> {
    /// Round-trip `SELECT 1` through the provider. Never fails: any error is
    /// logged and reported as `false`.
    pub async fn health_check(&self) -> bool {
        match self.provider().query("SELECT 1").await {
            Ok(_) => true,
            Err(err) => {
                self.log(
                    Level::ERROR,
                    &format!("Database health check failed: {}", err),
                    None,
                );
                false
            }
        }
    }

    /// 1 when the provider is initialized, 0 otherwise.
    ///
    /// This is a readiness signal, not a count of open sessions; use
    /// [`pool_stats`](Self::pool_stats) for that.
    pub fn active_connection_count(&self) -> usize {
        usize::from(self.provider().is_initialized())
    }

    /// Pool statistics, when the provider tracks them
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.provider().pool_stats().await
    }

    pub fn is_transaction_active<S: Session>(&self, session: &S) -> bool {
        session.is_transaction_active()
    }

    /// Nesting depth seen from a bare session: 1 inside a transaction, else 0.
    /// Savepoints are only counted by [`TransactionScope::depth`](super::TransactionScope::depth).
    pub fn transaction_depth<S: Session>(&self, session: &S) -> usize {
        usize::from(session.is_transaction_active())
    }
}
