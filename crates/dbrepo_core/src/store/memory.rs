//! In-process store engine.
//!
//! # Responsibility
//! - Provide a dependency-free `EngineHandle` for tests and demos.
//! - Count session lifecycle calls so callers can verify open/close and
//!   commit/rollback discipline.
//!
//! # Invariants
//! - Outside a transaction, writes are visible immediately.
//! - Inside a transaction, reads see the tables as of `begin` plus the
//!   session's own writes. The writes are recorded and replayed onto the
//!   current shared tables on commit, so rows committed by other sessions in
//!   the meantime are kept. Rollback or close discards them.
//! - `sessions_closed` counts explicit `close()` calls only.

use super::{
    ensure_filtered, ensure_identifier, row_matches, EngineHandle, Fields, InsertItem, Session,
    StoreError, StoreResult,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Tables = BTreeMap<String, Vec<Fields>>;

/// One write recorded inside a transaction.
enum Write {
    Insert(Vec<InsertItem>),
    Update {
        table: String,
        filters: Fields,
        params: Fields,
    },
    Delete {
        table: String,
        filters: Fields,
    },
}

impl Write {
    fn apply(&self, tables: &mut Tables) -> u64 {
        match self {
            Self::Insert(items) => {
                for item in items {
                    tables
                        .entry(item.table.clone())
                        .or_default()
                        .push(item.fields.clone());
                }
                items.len() as u64
            }
            Self::Update {
                table,
                filters,
                params,
            } => {
                let Some(rows) = tables.get_mut(table) else {
                    return 0;
                };
                let mut changed = 0;
                for row in rows.iter_mut().filter(|row| row_matches(row, filters)) {
                    for (column, value) in params {
                        row.insert(column.clone(), value.clone());
                    }
                    changed += 1;
                }
                changed
            }
            Self::Delete { table, filters } => {
                let Some(rows) = tables.get_mut(table) else {
                    return 0;
                };
                let before = rows.len();
                rows.retain(|row| !row_matches(row, filters));
                (before - rows.len()) as u64
            }
        }
    }
}

/// Open transaction of one session.
struct Pending {
    working: Tables,
    writes: Vec<Write>,
}

/// Snapshot of lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    fail_open: AtomicBool,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
}

#[derive(Default)]
struct MemoryShared {
    tables: Mutex<Tables>,
    counters: Counters,
    faults: Faults,
}

impl MemoryShared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory engine. Clones observe the same tables and counters.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<MemoryShared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.shared.counters;
        MemoryStats {
            sessions_opened: counters.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: counters.sessions_closed.load(Ordering::SeqCst),
            begins: counters.begins.load(Ordering::SeqCst),
            commits: counters.commits.load(Ordering::SeqCst),
            rollbacks: counters.rollbacks.load(Ordering::SeqCst),
        }
    }

    /// Returns committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Fields> {
        self.shared.tables().get(table).cloned().unwrap_or_default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.shared.faults.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.shared.faults.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.faults.fail_commit.store(fail, Ordering::SeqCst);
    }
}

impl EngineHandle for MemoryEngine {
    fn driver(&self) -> &'static str {
        "memory"
    }

    fn new_session(&self) -> StoreResult<Box<dyn Session>> {
        if self.shared.faults.fail_open.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("open"));
        }
        self.shared
            .counters
            .sessions_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            pending: None,
            closed: false,
        }))
    }
}

/// Session over a `MemoryEngine`.
pub struct MemorySession {
    shared: Arc<MemoryShared>,
    pending: Option<Pending>,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn write(&mut self, write: Write) -> StoreResult<u64> {
        self.ensure_open()?;
        match self.pending.as_mut() {
            Some(pending) => {
                let changed = write.apply(&mut pending.working);
                pending.writes.push(write);
                Ok(changed)
            }
            None => Ok(write.apply(&mut self.shared.tables())),
        }
    }

    fn read<T>(&self, read: impl FnOnce(&Tables) -> T) -> StoreResult<T> {
        self.ensure_open()?;
        match self.pending.as_ref() {
            Some(pending) => Ok(read(&pending.working)),
            None => Ok(read(&self.shared.tables())),
        }
    }
}

impl Session for MemorySession {
    fn begin(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.shared.faults.fail_begin.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("begin"));
        }
        if self.pending.is_none() {
            self.pending = Some(Pending {
                working: self.shared.tables().clone(),
                writes: Vec::new(),
            });
        }
        self.shared.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.pending.is_none() {
            return Err(StoreError::NoActiveTransaction);
        }
        if self.shared.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("commit"));
        }
        if let Some(pending) = self.pending.take() {
            let mut tables = self.shared.tables();
            for write in &pending.writes {
                write.apply(&mut tables);
            }
        }
        self.shared.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.pending.take().is_some() {
            self.shared.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;
        self.shared
            .counters
            .sessions_closed
            .fetch_add(1, Ordering::SeqCst);
    }

    fn insert_multi(&mut self, items: &[InsertItem]) -> StoreResult<u64> {
        for item in items {
            ensure_identifier(&item.table)?;
            if item.fields.is_empty() {
                return Err(StoreError::EmptyWrite {
                    table: item.table.clone(),
                });
            }
            for column in item.fields.keys() {
                ensure_identifier(column)?;
            }
        }
        self.write(Write::Insert(items.to_vec()))
    }

    fn update(&mut self, table: &str, filters: &Fields, params: &Fields) -> StoreResult<u64> {
        ensure_identifier(table)?;
        ensure_filtered(table, filters)?;
        if params.is_empty() {
            return Err(StoreError::EmptyWrite {
                table: table.to_string(),
            });
        }
        for column in filters.keys().chain(params.keys()) {
            ensure_identifier(column)?;
        }
        self.write(Write::Update {
            table: table.to_string(),
            filters: filters.clone(),
            params: params.clone(),
        })
    }

    fn delete(&mut self, table: &str, filters: &Fields) -> StoreResult<u64> {
        ensure_identifier(table)?;
        ensure_filtered(table, filters)?;
        self.write(Write::Delete {
            table: table.to_string(),
            filters: filters.clone(),
        })
    }

    fn find(&mut self, table: &str, filters: &Fields) -> StoreResult<Vec<Fields>> {
        ensure_identifier(table)?;
        self.read(|tables| {
            tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| row_matches(row, filters))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryEngine;
    use crate::store::{fields, EngineHandle, Fields, InsertItem, StoreError};

    #[test]
    fn transaction_writes_are_private_until_commit() {
        let engine = MemoryEngine::new();
        let mut writer = engine.new_session().expect("writer");
        writer.begin().expect("begin");
        writer
            .insert_multi(&[InsertItem::new("users").field("name", "ada")])
            .expect("insert");
        assert!(engine.rows("users").is_empty());

        writer.commit().expect("commit");
        assert_eq!(engine.rows("users").len(), 1);
        writer.close();

        let stats = engine.stats();
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.rollbacks, 0);
    }

    #[test]
    fn commit_keeps_rows_committed_by_other_sessions() {
        let engine = MemoryEngine::new();
        let mut writer = engine.new_session().expect("writer");
        writer.begin().expect("begin");
        writer
            .insert_multi(&[InsertItem::new("users").field("name", "in_tx")])
            .expect("insert in tx");

        let mut other = engine.new_session().expect("other");
        other
            .insert_multi(&[InsertItem::new("users").field("name", "outside")])
            .expect("autocommit insert");
        other.close();

        let seen = writer.find("users", &Fields::new()).expect("find in tx");
        assert_eq!(seen.len(), 1);

        writer
            .update("users", &fields([("name", "outside")]), &fields([("seen", true)]))
            .expect("update in tx");
        writer.commit().expect("commit");
        writer.close();

        let rows = engine.rows("users");
        let names: Vec<&str> = rows.iter().filter_map(|row| row["name"].as_text()).collect();
        assert_eq!(names, vec!["outside", "in_tx"]);
        assert_eq!(rows[0]["seen"].as_integer(), Some(1));
    }

    #[test]
    fn injected_commit_failure_keeps_work_for_rollback() {
        let engine = MemoryEngine::new();
        engine.set_fail_commit(true);
        let mut session = engine.new_session().expect("session");
        session.begin().expect("begin");
        session
            .insert_multi(&[InsertItem::new("users").field("name", "ada")])
            .expect("insert");

        let err = session.commit().expect_err("commit should fail");
        assert!(matches!(err, StoreError::Injected("commit")));
        session.rollback().expect("rollback");
        session.close();

        assert!(engine.rows("users").is_empty());
        assert_eq!(engine.stats().rollbacks, 1);
        assert_eq!(engine.stats().commits, 0);
    }

    #[test]
    fn autocommit_update_and_delete_apply_immediately() {
        let engine = MemoryEngine::new();
        let mut session = engine.new_session().expect("session");
        session
            .insert_multi(&[
                InsertItem::new("users").field("name", "ada"),
                InsertItem::new("users").field("name", "bob"),
            ])
            .expect("insert");
        let updated = session
            .update("users", &fields([("name", "ada")]), &fields([("admin", true)]))
            .expect("update");
        assert_eq!(updated, 1);
        let deleted = session
            .delete("users", &fields([("name", "bob")]))
            .expect("delete");
        assert_eq!(deleted, 1);

        let rows = engine.rows("users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["admin"].as_integer(), Some(1));
    }

    #[test]
    fn open_fault_prevents_session_creation() {
        let engine = MemoryEngine::new();
        engine.set_fail_open(true);
        assert!(engine.new_session().is_err());
        assert_eq!(engine.stats().sessions_opened, 0);
    }
}
