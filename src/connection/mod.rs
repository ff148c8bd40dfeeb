pub mod config;
pub mod pool;
pub mod statement;

use crate::core::{DbError, Result};
use crate::interface::Session;
use crate::result::QueryResult;
use crate::storage::{InMemoryStorage, LockAttempt, RowKey, Write};
use async_trait::async_trait;
use pool::PoolShared;
use serde_json::Value;
use statement::{Statement, parse_statement};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// Handed out by the pool, `connect()` not yet called
    Pending,
    Active,
    InTransaction,
    Closed,
}

/// Data-access context of an in-memory session
///
/// Reads see the session's own uncommitted writes on top of committed data.
/// Writes take an exclusive row lock held until commit or rollback; outside a
/// transaction they commit immediately.
pub struct MemoryData {
    session_id: u64,
    state: ConnectionState,
    storage: Arc<InMemoryStorage>,
    lock_timeout: Duration,
    poll_interval: Duration,
    /// Uncommitted write log of the open transaction
    writes: Vec<Write>,
    /// Savepoint name -> write log length when it was taken
    savepoints: Vec<(String, usize)>,
}

impl MemoryData {
    fn new(session_id: u64, storage: Arc<InMemoryStorage>, lock_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            session_id,
            state: ConnectionState::Pending,
            storage,
            lock_timeout,
            poll_interval,
            writes: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    /// Session ID this context belongs to
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Read a row
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let row = RowKey::new(table, key);
        if let Some(write) = self.writes.iter().rev().find(|w| w.row == row) {
            return Ok(write.value.clone());
        }
        self.storage.read(&row)
    }

    /// All visible rows of a table in key order
    pub fn scan(&self, table: &str) -> Result<Vec<(String, Value)>> {
        self.ensure_open()?;
        let mut rows: BTreeMap<String, Value> = self.storage.scan(table)?.into_iter().collect();
        for write in self.writes.iter().filter(|w| w.row.table == table) {
            match &write.value {
                Some(value) => {
                    rows.insert(write.row.key.clone(), value.clone());
                }
                None => {
                    rows.remove(&write.row.key);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    /// Insert or replace a row
    pub async fn put(&mut self, table: &str, key: &str, value: Value) -> Result<()> {
        self.stage(RowKey::new(table, key), Some(value)).await
    }

    /// Delete a row. Deleting a missing row is not an error.
    pub async fn delete(&mut self, table: &str, key: &str) -> Result<()> {
        self.stage(RowKey::new(table, key), None).await
    }

    /// Number of uncommitted writes
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    async fn stage(&mut self, row: RowKey, value: Option<Value>) -> Result<()> {
        self.ensure_open()?;
        self.lock(&row).await?;

        let write = Write { row, value };
        if self.state == ConnectionState::InTransaction {
            self.writes.push(write);
            return Ok(());
        }

        // Autocommit
        let applied = self.storage.apply(std::slice::from_ref(&write));
        self.storage.release_locks(self.session_id)?;
        applied
    }

    async fn lock(&self, row: &RowKey) -> Result<()> {
        let start = Instant::now();

        loop {
            match self.storage.lock_row(self.session_id, row)? {
                LockAttempt::Acquired => return Ok(()),
                LockAttempt::Deadlock { holder } => {
                    event!(
                        Level::DEBUG,
                        session = self.session_id,
                        holder,
                        row = %row,
                        "deadlock victim chosen"
                    );
                    return Err(DbError::Deadlock(format!(
                        "session {} waits for {} held by session {}, which waits for session {}",
                        self.session_id, row, holder, self.session_id
                    )));
                }
                LockAttempt::Blocked { holder } => {
                    if start.elapsed() >= self.lock_timeout {
                        self.storage.clear_wait(self.session_id)?;
                        event!(
                            Level::DEBUG,
                            session = self.session_id,
                            holder,
                            row = %row,
                            "lock wait timed out"
                        );
                        return Err(DbError::LockTimeout(format!(
                            "exceeded {}ms waiting for {} held by session {}",
                            self.lock_timeout.as_millis(),
                            row,
                            holder
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Pending => {
                Err(DbError::ConnectionError("Connection not established".into()))
            }
            ConnectionState::Closed => Err(DbError::ConnectionError("Connection is closed".into())),
            ConnectionState::Active | ConnectionState::InTransaction => Ok(()),
        }
    }

    fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == ConnectionState::InTransaction {
            return Err(DbError::TransactionError("Transaction already active".into()));
        }
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionError("No active transaction".into()));
        }
        self.storage.apply(&self.writes)?;
        self.end_transaction()
    }

    fn rollback(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionError("No active transaction".into()));
        }
        self.end_transaction()
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.writes.clear();
        self.savepoints.clear();
        self.state = ConnectionState::Active;
        self.storage.release_locks(self.session_id)?;
        Ok(())
    }

    fn savepoint(&mut self, name: String) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionError(
                "SAVEPOINT can only be used in transaction blocks".into(),
            ));
        }
        self.savepoints.push((name, self.writes.len()));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.find_savepoint(name)?;
        let mark = self.savepoints[position].1;
        // The savepoint itself survives a rollback to it
        self.savepoints.truncate(position + 1);
        self.writes.truncate(mark);
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.find_savepoint(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionError(
                "Savepoints can only be used in transaction blocks".into(),
            ));
        }
        self.savepoints
            .iter()
            .rposition(|(existing, _)| existing == name)
            .ok_or_else(|| {
                DbError::TransactionError(format!("savepoint \"{}\" does not exist", name))
            })
    }

    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.ensure_open()?;
        match parse_statement(sql)? {
            Statement::Begin => self.begin().map(|_| QueryResult::empty()),
            Statement::Commit => self.commit().map(|_| QueryResult::empty()),
            Statement::Rollback => self.rollback().map(|_| QueryResult::empty()),
            Statement::Savepoint(name) => self.savepoint(name).map(|_| QueryResult::empty()),
            Statement::RollbackToSavepoint(name) => {
                self.rollback_to_savepoint(&name).map(|_| QueryResult::empty())
            }
            Statement::ReleaseSavepoint(name) => {
                self.release_savepoint(&name).map(|_| QueryResult::empty())
            }
            Statement::SelectLiterals(result) => Ok(result),
        }
    }

    /// Drop every trace of the open transaction without touching committed data
    fn abandon(&mut self) {
        self.writes.clear();
        self.savepoints.clear();
        self.state = ConnectionState::Closed;
        if let Err(err) = self.storage.release_locks(self.session_id) {
            event!(
                Level::WARN,
                session = self.session_id,
                error = %err,
                "failed to release row locks"
            );
        }
    }
}

/// Session handed out by [`MemoryPool`](pool::MemoryPool)
///
/// Dropping a session that was never released rolls back its transaction and
/// frees its pool slot.
pub struct MemorySession {
    data: MemoryData,
    pool: Arc<PoolShared>,
    released: bool,
}

impl MemorySession {
    pub(crate) fn new(id: u64, pool: Arc<PoolShared>) -> Self {
        let config = pool.config();
        let data = MemoryData::new(
            id,
            pool.storage(),
            config.lock_timeout,
            config.lock_poll_interval,
        );
        Self {
            data,
            pool,
            released: false,
        }
    }

    /// Get session ID
    pub fn id(&self) -> u64 {
        self.data.session_id
    }

    /// Check if the session is usable
    pub fn is_active(&self) -> bool {
        matches!(
            self.data.state,
            ConnectionState::Active | ConnectionState::InTransaction
        )
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[async_trait]
impl Session for MemorySession {
    type Data = MemoryData;

    async fn connect(&mut self) -> Result<()> {
        match self.data.state {
            ConnectionState::Pending => {
                self.data.state = ConnectionState::Active;
                Ok(())
            }
            ConnectionState::Active | ConnectionState::InTransaction => Ok(()),
            ConnectionState::Closed => Err(DbError::ConnectionError("Connection is closed".into())),
        }
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.data.begin()
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.data.commit()
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.data.rollback()
    }

    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(DbError::ConnectionError("Session already released".into()));
        }

        if self.data.state == ConnectionState::InTransaction {
            event!(
                Level::WARN,
                session = self.id(),
                "session released with an open transaction, rolling back"
            );
        }
        self.data.abandon();
        self.released = true;
        self.pool.release_slot(self.id());
        Ok(())
    }

    async fn query(&mut self, statement: &str) -> Result<QueryResult> {
        self.data.execute(statement)
    }

    fn is_transaction_active(&self) -> bool {
        self.data.state == ConnectionState::InTransaction
    }

    fn data(&mut self) -> &mut MemoryData {
        &mut self.data
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.released {
            event!(
                Level::WARN,
                session = self.id(),
                "session dropped without release, returning slot to pool"
            );
            self.data.abandon();
            self.released = true;
            self.pool.release_slot(self.id());
        }
    }
}
