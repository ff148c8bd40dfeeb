use super::id::TransactionId;
use super::log::TransactionLog;
use crate::core::Result;
use crate::interface::Session;
use crate::result::QueryResult;
use std::sync::Arc;
use tracing::Level;

/// The session-scoped context a unit of work runs against.
///
/// Owns the session for the duration of one coordinator invocation and exposes
/// only what a unit of work should touch: the data-access context, raw
/// statements and savepoints. Commit, rollback and release stay with the
/// coordinator.
pub struct TransactionScope<S: Session> {
    id: TransactionId,
    context: Option<String>,
    session: S,
    /// Savepoints opened through this scope and not yet finished, innermost last
    pub(super) savepoints: Vec<String>,
    log: Arc<dyn TransactionLog>,
}

impl<S: Session> TransactionScope<S> {
    pub(crate) fn new(
        id: TransactionId,
        context: Option<String>,
        session: S,
        log: Arc<dyn TransactionLog>,
    ) -> Self {
        Self {
            id,
            context,
            session,
            savepoints: Vec::new(),
            log,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Correlation label passed by the caller
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Data-access context of the underlying session
    pub fn data(&mut self) -> &mut S::Data {
        self.session.data()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Execute a raw statement on the transaction's session
    pub async fn query(&mut self, statement: &str) -> Result<QueryResult> {
        self.session.query(statement).await
    }

    pub fn is_active(&self) -> bool {
        self.session.is_transaction_active()
    }

    /// 0 without an open transaction, otherwise 1 plus the number of savepoints
    /// currently open through this scope.
    pub fn depth(&self) -> usize {
        if self.is_active() {
            1 + self.savepoints.len()
        } else {
            0
        }
    }

    pub fn active_savepoints(&self) -> &[String] {
        &self.savepoints
    }

    pub(crate) fn log(&self, level: Level, message: &str) {
        self.log.log(level, message, self.context.as_deref());
    }

    pub(crate) fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub(crate) fn into_session(self) -> S {
        self.session
    }
}
