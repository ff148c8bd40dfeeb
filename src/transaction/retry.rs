use super::coordinator::TransactionCoordinator;
use super::scope::TransactionScope;
use crate::core::DbError;
use crate::interface::SessionProvider;
use futures::future::BoxFuture;
use std::fmt;
use std::fmt::Display;
use tracing::Level;

/// Kind of lock contention that makes a transaction worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentionKind {
    Deadlock,
    LockTimeout,
}

impl fmt::Display for ContentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentionKind::Deadlock => write!(f, "Deadlock"),
            ContentionKind::LockTimeout => write!(f, "Lock wait timeout"),
        }
    }
}

/// Lower-case fragments of driver error text that signal lock contention.
///
/// Covers PostgreSQL (`deadlock detected`, SQLSTATE 40P01 / 55P03), MySQL
/// (`Deadlock found`, `Lock wait timeout exceeded`, ER_LOCK_*), and SQL Server
/// (errors 1205 / 1222). Drivers that word these differently, or localize them,
/// are not recognized.
pub const CONTENTION_SIGNATURES: &[(&str, ContentionKind)] = &[
    ("deadlock detected", ContentionKind::Deadlock),
    ("deadlock found", ContentionKind::Deadlock),
    ("er_lock_deadlock", ContentionKind::Deadlock),
    ("40p01", ContentionKind::Deadlock),
    ("was deadlocked on lock", ContentionKind::Deadlock),
    ("lock wait timeout", ContentionKind::LockTimeout),
    ("er_lock_wait_timeout", ContentionKind::LockTimeout),
    ("55p03", ContentionKind::LockTimeout),
    ("lock request time out", ContentionKind::LockTimeout),
];

/// Case-insensitive substring match against [`CONTENTION_SIGNATURES`]
pub fn classify_message(message: &str) -> Option<ContentionKind> {
    let lower = message.to_lowercase();
    CONTENTION_SIGNATURES
        .iter()
        .find(|(signature, _)| lower.contains(signature))
        .map(|(_, kind)| *kind)
}

/// Errors that can tell whether they were caused by lock contention
pub trait LockContention {
    fn lock_contention(&self) -> Option<ContentionKind>;
}

impl LockContention for DbError {
    fn lock_contention(&self) -> Option<ContentionKind> {
        match self {
            DbError::Deadlock(_) => Some(ContentionKind::Deadlock),
            DbError::LockTimeout(_) => Some(ContentionKind::LockTimeout),
            // Caller mistakes and our own budget expiry are never contention
            DbError::InvalidSavepoint(_) | DbError::Timeout(_) => None,
            // Everything else may be driver text in disguise
            DbError::ConnectionError(message)
            | DbError::PoolTimeout(message)
            | DbError::TransactionError(message)
            | DbError::ParseError(message)
            | DbError::ExecutionError(message)
            | DbError::UnsupportedOperation(message)
            | DbError::LockError(message) => classify_message(message),
        }
    }
}

impl LockContention for anyhow::Error {
    fn lock_contention(&self) -> Option<ContentionKind> {
        if let Some(db_error) = self.downcast_ref::<DbError>() {
            return db_error.lock_contention();
        }
        self.chain()
            .find_map(|cause| match cause.downcast_ref::<DbError>() {
                Some(db_error) => db_error.lock_contention(),
                None => classify_message(&cause.to_string()),
            })
    }
}

impl<P: SessionProvider> TransactionCoordinator<P> {
    /// [`run_in_transaction`](Self::run_in_transaction) with deadlock-aware retry,
    /// using the configured default number of attempts (3 unless configured).
    pub async fn run_with_retry<T, E, F>(&self, context: Option<&str>, work: F) -> Result<T, E>
    where
        F: for<'s> Fn(&'s mut TransactionScope<P::Session>) -> BoxFuture<'s, Result<T, E>>,
        E: From<DbError> + LockContention + Display,
    {
        self.run_with_retry_attempts(self.config().retry.max_attempts, context, work)
            .await
    }

    /// Run `work` in a transaction, re-running the whole transaction when it fails
    /// with lock contention.
    ///
    /// `max_attempts` bounds the number of transaction invocations; 0 is treated
    /// as 1. Errors that are not contention return immediately. Between attempts
    /// the coordinator sleeps `min(base * 2^(attempt-1), max) + jitter`.
    ///
    /// `work` may run several times and must be safe to repeat: effects outside
    /// the transaction (emails, HTTP calls, in-memory counters) are not undone.
    pub async fn run_with_retry_attempts<T, E, F>(
        &self,
        max_attempts: u32,
        context: Option<&str>,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'s> Fn(&'s mut TransactionScope<P::Session>) -> BoxFuture<'s, Result<T, E>>,
        E: From<DbError> + LockContention + Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            self.log(
                Level::DEBUG,
                &format!("Attempt {}/{}", attempt, max_attempts),
                context,
            );

            let err = match self.run_in_transaction(context, &work).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(kind) = err.lock_contention() else {
                return Err(err);
            };

            if attempt >= max_attempts {
                self.log(
                    Level::ERROR,
                    &format!(
                        "{} persisted after {} attempts, giving up: {}",
                        kind, max_attempts, err
                    ),
                    context,
                );
                return Err(err);
            }

            let delay = self.config().retry.delay(attempt);
            self.log(
                Level::WARN,
                &format!(
                    "{} detected (attempt {}/{}), retrying in {}ms: {}",
                    kind,
                    attempt,
                    max_attempts,
                    delay.as_millis(),
                    err
                ),
                context,
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
