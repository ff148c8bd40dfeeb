use crate::core::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Address of a single row: table name plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub table: String,
    pub key: String,
}

impl RowKey {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// A pending row change. `None` deletes the row.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub row: RowKey,
    pub value: Option<Value>,
}

/// Outcome of a row lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Another session holds the row; the requester is now registered as waiting.
    Blocked { holder: u64 },
    /// Waiting would close a cycle in the wait-for graph. The requester is the victim
    /// and its wait registration has been dropped.
    Deadlock { holder: u64 },
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, BTreeMap<String, Value>>,
    /// Exclusive row locks: row -> owning session
    locks: HashMap<RowKey, u64>,
    /// Wait-for edges: session -> row it is blocked on
    waits: HashMap<u64, RowKey>,
}

/// Committed row storage shared by every session of a pool.
///
/// Uses a plain mutex: no operation here suspends, and sessions must be able to
/// drop their locks from `Drop`.
pub struct InMemoryStorage {
    state: Mutex<StoreState>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Read the committed value of a row
    pub fn read(&self, row: &RowKey) -> Result<Option<Value>> {
        let state = self.state.lock()?;
        Ok(state
            .tables
            .get(&row.table)
            .and_then(|table| table.get(&row.key))
            .cloned())
    }

    /// Committed rows of a table in key order
    pub fn scan(&self, table: &str) -> Result<Vec<(String, Value)>> {
        let state = self.state.lock()?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    /// Request the exclusive lock on `row` for `session`. Re-entrant.
    pub fn lock_row(&self, session: u64, row: &RowKey) -> Result<LockAttempt> {
        let mut state = self.state.lock()?;

        let holder = match state.locks.get(row) {
            None => None,
            Some(&owner) if owner == session => None,
            Some(&owner) => Some(owner),
        };

        let Some(holder) = holder else {
            state.locks.insert(row.clone(), session);
            state.waits.remove(&session);
            return Ok(LockAttempt::Acquired);
        };

        state.waits.insert(session, row.clone());

        // Follow holder -> row it waits on -> that row's holder ...
        let mut current = holder;
        for _ in 0..=state.waits.len() {
            if current == session {
                state.waits.remove(&session);
                return Ok(LockAttempt::Deadlock { holder });
            }
            let next = state
                .waits
                .get(&current)
                .and_then(|blocked_on| state.locks.get(blocked_on))
                .copied();
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        Ok(LockAttempt::Blocked { holder })
    }

    /// Drop the wait registration of a session that gave up waiting
    pub fn clear_wait(&self, session: u64) -> Result<()> {
        let mut state = self.state.lock()?;
        state.waits.remove(&session);
        Ok(())
    }

    /// Publish a write log. Later writes to the same row win.
    pub fn apply(&self, writes: &[Write]) -> Result<()> {
        let mut state = self.state.lock()?;
        for write in writes {
            let table = state.tables.entry(write.row.table.clone()).or_default();
            match &write.value {
                Some(value) => {
                    table.insert(write.row.key.clone(), value.clone());
                }
                None => {
                    table.remove(&write.row.key);
                }
            }
        }
        Ok(())
    }

    /// Release every lock held by a session. Returns how many were held.
    pub fn release_locks(&self, session: u64) -> Result<usize> {
        let mut state = self.state.lock()?;
        let before = state.locks.len();
        state.locks.retain(|_, owner| *owner != session);
        state.waits.remove(&session);
        Ok(before - state.locks.len())
    }

    /// Rows currently locked by a session, sorted
    pub fn locked_rows(&self, session: u64) -> Result<Vec<RowKey>> {
        let state = self.state.lock()?;
        let mut rows: Vec<RowKey> = state
            .locks
            .iter()
            .filter(|(_, owner)| **owner == session)
            .map(|(row, _)| row.clone())
            .collect();
        rows.sort();
        Ok(rows)
    }
}

#[cfg(test)]
impl InMemoryStorage {
    /// Poison the state mutex by panicking while it is held
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| -> () {
                    let _guard = self.state.lock();
                    panic!("poisoning storage");
                })
                .join()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use serde_json::json;

    fn row(key: &str) -> RowKey {
        RowKey::new("accounts", key)
    }

    #[test]
    fn test_poisoned_state_is_an_error() {
        let storage = InMemoryStorage::new();
        storage.poison();
        assert!(matches!(storage.release_locks(1), Err(DbError::LockError(_))));
    }

    #[test]
    fn test_apply_and_read() {
        let storage = InMemoryStorage::new();
        storage
            .apply(&[
                Write { row: row("1"), value: Some(json!(100)) },
                Write { row: row("2"), value: Some(json!(50)) },
                Write { row: row("2"), value: None },
            ])
            .unwrap();

        assert_eq!(storage.read(&row("1")).unwrap(), Some(json!(100)));
        assert_eq!(storage.read(&row("2")).unwrap(), None);
        assert_eq!(storage.scan("accounts").unwrap().len(), 1);
        assert!(storage.scan("missing").unwrap().is_empty());
    }

    #[test]
    fn test_lock_is_reentrant_and_exclusive() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.lock_row(1, &row("1")).unwrap(), LockAttempt::Acquired);
        assert_eq!(storage.lock_row(1, &row("1")).unwrap(), LockAttempt::Acquired);
        assert_eq!(
            storage.lock_row(2, &row("1")).unwrap(),
            LockAttempt::Blocked { holder: 1 }
        );

        assert_eq!(storage.release_locks(1).unwrap(), 1);
        assert_eq!(storage.lock_row(2, &row("1")).unwrap(), LockAttempt::Acquired);
        assert_eq!(storage.locked_rows(2).unwrap(), vec![row("1")]);
    }

    #[test]
    fn test_wait_for_cycle_is_a_deadlock() {
        let storage = InMemoryStorage::new();
        storage.lock_row(1, &row("a")).unwrap();
        storage.lock_row(2, &row("b")).unwrap();

        // 1 waits on b (held by 2): no cycle yet
        assert_eq!(
            storage.lock_row(1, &row("b")).unwrap(),
            LockAttempt::Blocked { holder: 2 }
        );
        // 2 waits on a (held by 1), and 1 waits on 2: cycle
        assert_eq!(
            storage.lock_row(2, &row("a")).unwrap(),
            LockAttempt::Deadlock { holder: 1 }
        );

        // the victim backs out; the survivor gets its row
        storage.release_locks(2).unwrap();
        assert_eq!(storage.lock_row(1, &row("b")).unwrap(), LockAttempt::Acquired);
    }

    #[test]
    fn test_three_party_cycle() {
        let storage = InMemoryStorage::new();
        storage.lock_row(1, &row("a")).unwrap();
        storage.lock_row(2, &row("b")).unwrap();
        storage.lock_row(3, &row("c")).unwrap();

        assert!(matches!(storage.lock_row(1, &row("b")).unwrap(), LockAttempt::Blocked { .. }));
        assert!(matches!(storage.lock_row(2, &row("c")).unwrap(), LockAttempt::Blocked { .. }));
        assert!(matches!(storage.lock_row(3, &row("a")).unwrap(), LockAttempt::Deadlock { .. }));
    }
}
