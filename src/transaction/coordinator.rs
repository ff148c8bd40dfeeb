use super::id::TransactionId;
use super::log::{TracingLog, TransactionLog};
use super::policy::TransactionConfig;
use super::scope::TransactionScope;
use crate::core::{DbError, Result};
use crate::interface::{Session, SessionProvider};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::Level;

type PanicPayload = Box<dyn Any + Send>;

/// Runs units of work atomically on sessions drawn from a [`SessionProvider`].
///
/// Every invocation follows `acquire -> begin -> work -> commit | rollback ->
/// release`, strictly in that order, and releases the session exactly once no
/// matter how the work ends: success, error, timeout or panic.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use txcoord::{ConnectionConfig, DbError, MemoryPool, TransactionCoordinator};
///
/// # #[tokio::main]
/// # async fn main() -> txcoord::Result<()> {
/// let pool = MemoryPool::new(ConnectionConfig::new("clinic"))?;
/// let coordinator = TransactionCoordinator::new(pool);
///
/// let paid = coordinator
///     .run_in_transaction(Some("record_payment"), |tx| {
///         Box::pin(async move {
///             tx.data().put("payments", "pay_1", json!({"amount": 80})).await?;
///             tx.data().put("appointments", "apt_7", json!({"status": "paid"})).await?;
///             Ok::<_, DbError>(80)
///         })
///     })
///     .await?;
///
/// assert_eq!(paid, 80);
/// # Ok(())
/// # }
/// ```
pub struct TransactionCoordinator<P: SessionProvider> {
    provider: Arc<P>,
    log: Arc<dyn TransactionLog>,
    config: TransactionConfig,
}

impl<P: SessionProvider> Clone for TransactionCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            log: Arc::clone(&self.log),
            config: self.config.clone(),
        }
    }
}

impl<P: SessionProvider> TransactionCoordinator<P> {
    /// Coordinator with default configuration, logging through `tracing`
    pub fn new(provider: P) -> Self {
        Self::with_shared_provider(Arc::new(provider))
    }

    pub fn with_shared_provider(provider: Arc<P>) -> Self {
        Self {
            provider,
            log: Arc::new(TracingLog),
            config: TransactionConfig::default(),
        }
    }

    /// Replace the logging sink
    pub fn with_log(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.log = log;
        self
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub(crate) fn log(&self, level: Level, message: &str, context: Option<&str>) {
        self.log.log(level, message, context);
    }

    /// Acquire and connect a session without opening a transaction.
    ///
    /// The caller owns the session from here on: nothing commits, rolls back or
    /// releases it automatically.
    pub async fn create_session_handle(&self) -> Result<P::Session> {
        let mut session = self.provider.create_session().await?;
        if let Err(err) = session.connect().await {
            self.log(
                Level::ERROR,
                &format!("Failed to connect session: {}", err),
                None,
            );
            if let Err(release_err) = session.release().await {
                self.log(
                    Level::ERROR,
                    &format!("Failed to release session after connect error: {}", release_err),
                    None,
                );
            }
            return Err(err);
        }
        Ok(session)
    }

    /// Run `work` inside one transaction.
    ///
    /// Commits and returns the value when `work` succeeds. When it fails, the
    /// transaction is rolled back and the error returned exactly as `work`
    /// produced it. A failing rollback is logged and never replaces that error.
    /// A failing commit is followed by a best-effort rollback and returned.
    pub async fn run_in_transaction<T, E, F>(&self, context: Option<&str>, work: F) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<P::Session>) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<DbError> + Display,
    {
        let id = TransactionId::new();
        self.log(Level::INFO, &format!("Starting transaction {}", id), context);

        let mut session = self.provider.create_session().await?;

        let opened = match session.connect().await {
            Ok(()) => session.begin_transaction().await,
            Err(err) => Err(err),
        };
        if let Err(err) = opened {
            self.log(
                Level::ERROR,
                &format!("Failed to begin transaction {}: {}", id, err),
                context,
            );
            self.release_session(&mut session, id, context).await;
            return Err(err.into());
        }

        let mut scope = TransactionScope::new(
            id,
            context.map(str::to_owned),
            session,
            Arc::clone(&self.log),
        );

        let outcome = match self.drive(&mut scope, work).await {
            Ok(Ok(value)) => match scope.session_mut().commit_transaction().await {
                Ok(()) => {
                    self.log(
                        Level::INFO,
                        &format!("Transaction {} committed", id),
                        context,
                    );
                    Ok(value)
                }
                Err(commit_err) => {
                    self.log(
                        Level::ERROR,
                        &format!("Commit failed for transaction {}: {}", id, commit_err),
                        context,
                    );
                    self.rollback_quietly(&mut scope).await;
                    Err(commit_err.into())
                }
            },
            Ok(Err(err)) => {
                self.log(
                    Level::ERROR,
                    &format!("Transaction {} rolled back: {}", id, err),
                    context,
                );
                self.rollback_quietly(&mut scope).await;
                Err(err)
            }
            Err(payload) => {
                self.log(
                    Level::ERROR,
                    &format!("Unit of work panicked, rolling back transaction {}", id),
                    context,
                );
                self.rollback_quietly(&mut scope).await;
                let mut session = scope.into_session();
                self.release_session(&mut session, id, context).await;
                panic::resume_unwind(payload);
            }
        };

        let mut session = scope.into_session();
        self.release_session(&mut session, id, context).await;
        outcome
    }

    /// [`TransactionScope::savepoint`], for callers holding the coordinator
    pub async fn run_with_savepoint<T, E, F>(
        &self,
        scope: &mut TransactionScope<P::Session>,
        name: Option<&str>,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<P::Session>) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<DbError> + Display,
    {
        scope.savepoint(name, work).await
    }

    /// Start `work`, then await it under the configured timeout. A panic, whether
    /// raised while building the future or while polling it, comes back as `Err`.
    async fn drive<'s, T, E, F>(
        &self,
        scope: &'s mut TransactionScope<P::Session>,
        work: F,
    ) -> std::result::Result<std::result::Result<T, E>, PanicPayload>
    where
        F: FnOnce(&'s mut TransactionScope<P::Session>) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<DbError>,
    {
        let id = scope.id();
        let future = panic::catch_unwind(AssertUnwindSafe(move || work(scope)))?;
        let future = AssertUnwindSafe(future).catch_unwind();

        match self.config.timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => Ok(Err(DbError::Timeout(format!(
                    "transaction {} exceeded {}ms",
                    id,
                    limit.as_millis()
                ))
                .into())),
            },
            None => future.await,
        }
    }

    async fn rollback_quietly(&self, scope: &mut TransactionScope<P::Session>) {
        if !scope.is_active() {
            return;
        }
        if let Err(err) = scope.session_mut().rollback_transaction().await {
            self.log(
                Level::ERROR,
                &format!("Rollback failed for transaction {}: {}", scope.id(), err),
                scope.context(),
            );
        }
    }

    async fn release_session(&self, session: &mut P::Session, id: TransactionId, context: Option<&str>) {
        match session.release().await {
            Ok(()) => self.log(
                Level::DEBUG,
                &format!("Session released for transaction {}", id),
                context,
            ),
            Err(err) => self.log(
                Level::ERROR,
                &format!("Failed to release session for transaction {}: {}", id, err),
                context,
            ),
        }
    }
}
