use super::scope::TransactionScope;
use crate::core::{DbError, Result};
use crate::interface::Session;
use chrono::Utc;
use futures::future::BoxFuture;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Level;

/// Longest identifier PostgreSQL keeps without truncation
const MAX_SAVEPOINT_NAME_LEN: usize = 63;

static NEXT_SAVEPOINT: AtomicU64 = AtomicU64::new(1);

/// `sp_<unix millis>_<process-wide counter>`
pub fn generate_savepoint_name() -> String {
    format!(
        "sp_{}_{}",
        Utc::now().timestamp_millis(),
        NEXT_SAVEPOINT.fetch_add(1, Ordering::Relaxed)
    )
}

/// Savepoint names are spliced into statements verbatim, so only plain
/// identifiers are accepted: ASCII letters, digits and `_`, not starting with a digit.
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::InvalidSavepoint("name cannot be empty".into()));
    }

    if name.len() > MAX_SAVEPOINT_NAME_LEN {
        return Err(DbError::InvalidSavepoint(format!(
            "'{}' is longer than {} bytes",
            name, MAX_SAVEPOINT_NAME_LEN
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::InvalidSavepoint(format!(
            "'{}' contains invalid characters",
            name
        )));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(DbError::InvalidSavepoint(format!(
            "'{}' cannot start with a digit",
            name
        )));
    }

    Ok(())
}

impl<S: Session> TransactionScope<S> {
    /// Run `work` behind a savepoint of this transaction.
    ///
    /// On success the savepoint is left for the outer commit to subsume; no
    /// `RELEASE` is issued. On failure the transaction is rolled back to the
    /// savepoint and the original error returned, leaving the outer transaction
    /// open. If the `ROLLBACK TO SAVEPOINT` itself fails, that error is returned
    /// instead: the outer transaction is then in an unknown state.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use txcoord::{ConnectionConfig, DbError, MemoryPool, TransactionCoordinator};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> txcoord::Result<()> {
    /// let coordinator = TransactionCoordinator::new(MemoryPool::new(ConnectionConfig::default())?);
    ///
    /// coordinator
    ///     .run_in_transaction(Some("checkout"), |tx| {
    ///         Box::pin(async move {
    ///             tx.data().put("orders", "o1", json!({"total": 30})).await?;
    ///
    ///             // A failed audit write must not sink the order
    ///             let audit: Result<(), DbError> = tx
    ///                 .savepoint(Some("audit"), |tx| {
    ///                     Box::pin(async move {
    ///                         tx.data().put("audit", "o1", json!("created")).await?;
    ///                         Err::<(), _>(DbError::ExecutionError("audit sink offline".into()))
    ///                     })
    ///                 })
    ///                 .await;
    ///             assert!(audit.is_err());
    ///             Ok::<_, DbError>(())
    ///         })
    ///     })
    ///     .await?;
    ///
    /// let storage = coordinator.provider().storage();
    /// assert!(storage.scan("orders")?.len() == 1);
    /// assert!(storage.scan("audit")?.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn savepoint<T, E, F>(&mut self, name: Option<&str>, work: F) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<S>) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<DbError> + Display,
    {
        if !self.is_active() {
            return Err(DbError::TransactionError(
                "savepoint requires an open transaction".into(),
            )
            .into());
        }

        let name = match name {
            Some(name) => {
                validate_savepoint_name(name)?;
                name.to_string()
            }
            None => generate_savepoint_name(),
        };

        if self.savepoints.contains(&name) {
            return Err(DbError::InvalidSavepoint(format!(
                "'{}' is already active in transaction {}",
                name,
                self.id()
            ))
            .into());
        }

        self.query(&format!("SAVEPOINT {}", name)).await?;
        self.savepoints.push(name.clone());
        self.log(
            Level::DEBUG,
            &format!("Created savepoint {} in transaction {}", name, self.id()),
        );

        let result = work(&mut *self).await;

        // Forget this savepoint and anything nested inside it
        if let Some(position) = self.savepoints.iter().rposition(|sp| *sp == name) {
            self.savepoints.truncate(position);
        }

        match result {
            Ok(value) => {
                self.log(Level::DEBUG, &format!("Savepoint {} completed", name));
                Ok(value)
            }
            Err(err) => {
                self.log(
                    Level::WARN,
                    &format!("Rolling back to savepoint {}: {}", name, err),
                );
                if let Err(rollback_err) = self.query(&format!("ROLLBACK TO SAVEPOINT {}", name)).await {
                    self.log(
                        Level::ERROR,
                        &format!(
                            "Rollback to savepoint {} failed: {} (original error: {})",
                            name, rollback_err, err
                        ),
                    );
                    return Err(rollback_err.into());
                }
                Err(err)
            }
        }
    }
}
