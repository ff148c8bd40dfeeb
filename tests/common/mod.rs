#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::Level;
use txcoord::{
    ConnectionConfig, DbError, MemoryPool, QueryResult, Result, RetryPolicy, Session,
    SessionProvider, TransactionConfig, TransactionCoordinator, TransactionLog,
};

/// Failures a [`ScriptedProvider`] injects
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_connect: bool,
    pub fail_begin: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_release: bool,
    pub fail_probe: bool,
    pub uninitialized: bool,
    /// Session statements starting with this prefix fail
    pub fail_statement: Option<String>,
}

/// Provider that records every call its sessions receive
pub struct ScriptedProvider {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<String>>>,
    next_id: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    type Session = ScriptedSession;

    async fn create_session(&self) -> Result<ScriptedSession> {
        self.calls.lock().unwrap().push("create".into());
        Ok(ScriptedSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
            in_transaction: false,
            statements: Vec::new(),
        })
    }

    async fn query(&self, statement: &str) -> Result<QueryResult> {
        self.calls.lock().unwrap().push(format!("probe:{}", statement));
        if self.script.fail_probe {
            return Err(DbError::ConnectionError("server unreachable".into()));
        }
        Ok(QueryResult::new(vec!["?column?".into()], vec![vec![json!(1)]]))
    }

    fn is_initialized(&self) -> bool {
        !self.script.uninitialized
    }
}

pub struct ScriptedSession {
    pub id: u64,
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<String>>>,
    in_transaction: bool,
    /// Statements seen by this session, exposed as its data-access context
    statements: Vec<String>,
}

impl ScriptedSession {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl Session for ScriptedSession {
    type Data = Vec<String>;

    async fn connect(&mut self) -> Result<()> {
        self.record("connect");
        if self.script.fail_connect {
            return Err(DbError::ConnectionError("connection refused".into()));
        }
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.record("begin");
        if self.script.fail_begin {
            return Err(DbError::TransactionError("begin refused".into()));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.record("commit");
        if self.script.fail_commit {
            return Err(DbError::TransactionError("commit refused".into()));
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.record("rollback");
        self.in_transaction = false;
        if self.script.fail_rollback {
            return Err(DbError::ConnectionError("connection lost during rollback".into()));
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.record("release");
        if self.script.fail_release {
            return Err(DbError::ConnectionError("release refused".into()));
        }
        Ok(())
    }

    async fn query(&mut self, statement: &str) -> Result<QueryResult> {
        self.record(&format!("query:{}", statement));
        self.statements.push(statement.to_string());
        if let Some(prefix) = &self.script.fail_statement {
            if statement.starts_with(prefix.as_str()) {
                return Err(DbError::ExecutionError(format!("{} failed", statement)));
            }
        }
        Ok(QueryResult::empty())
    }

    fn is_transaction_active(&self) -> bool {
        self.in_transaction
    }

    fn data(&mut self) -> &mut Vec<String> {
        &mut self.statements
    }
}

/// Log sink that keeps every line for assertions
#[derive(Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<(Level, String, Option<String>)>>,
}

impl RecordingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<(Level, String, Option<String>)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, message, _)| message)
            .collect()
    }

    pub fn count_containing(&self, level: Level, fragment: &str) -> usize {
        self.messages(level)
            .iter()
            .filter(|message| message.contains(fragment))
            .count()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|(_, _, context)| context)
            .collect()
    }
}

impl TransactionLog for RecordingLog {
    fn log(&self, level: Level, message: &str, context: Option<&str>) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string(), context.map(str::to_string)));
    }
}

/// Retry policy with millisecond delays so tests stay fast
pub fn fast_retry(max_attempts: u32) -> TransactionConfig {
    TransactionConfig::new().retry(RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_ms: 1,
    })
}

pub fn scripted(script: Script) -> (TransactionCoordinator<ScriptedProvider>, Arc<RecordingLog>) {
    let log = RecordingLog::new();
    let coordinator = TransactionCoordinator::new(ScriptedProvider::new(script))
        .with_log(log.clone())
        .with_config(fast_retry(3));
    (coordinator, log)
}

pub fn memory() -> (TransactionCoordinator<MemoryPool>, Arc<RecordingLog>) {
    let pool = MemoryPool::new(ConnectionConfig::new("test").max_connections(16)).unwrap();
    let log = RecordingLog::new();
    let coordinator = TransactionCoordinator::new(pool)
        .with_log(log.clone())
        .with_config(fast_retry(3));
    (coordinator, log)
}
