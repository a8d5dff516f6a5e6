//! SQLite engine and session backed by `rusqlite`.
//!
//! # Responsibility
//! - Open one configured connection per session.
//! - Translate the row-level session primitives into parameterized SQL.
//!
//! # Invariants
//! - Returned connections have `foreign_keys` applied as configured and a
//!   busy timeout set.
//! - Every identifier is validated before being quoted into SQL; values are
//!   always bound, never inlined.

use super::{
    ensure_filtered, ensure_identifier, EngineHandle, Fields, InsertItem, Session, StoreError,
    StoreResult, Value,
};
use log::{error, info, warn};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File-backed SQLite engine.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    path: PathBuf,
    busy_timeout: Duration,
    foreign_keys: bool,
}

impl SqliteEngine {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            foreign_keys: true,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs schema or seed SQL on a private connection.
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let started_at = Instant::now();
        info!("event=db_open module=store status=start driver=sqlite");

        let conn = match Connection::open(&self.path) {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "event=db_open module=store status=error driver=sqlite duration_ms={} error_code=db_open_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err.into());
            }
        };

        match self.configure(&conn) {
            Ok(()) => {
                info!(
                    "event=db_open module=store status=ok driver=sqlite duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(conn)
            }
            Err(err) => {
                error!(
                    "event=db_open module=store status=error driver=sqlite duration_ms={} error_code=db_configure_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn configure(&self, conn: &Connection) -> StoreResult<()> {
        let pragma = if self.foreign_keys {
            "PRAGMA foreign_keys = ON;"
        } else {
            "PRAGMA foreign_keys = OFF;"
        };
        conn.execute_batch(pragma)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(())
    }
}

impl EngineHandle for SqliteEngine {
    fn driver(&self) -> &'static str {
        "sqlite"
    }

    fn new_session(&self) -> StoreResult<Box<dyn Session>> {
        let conn = self.open_connection()?;
        Ok(Box::new(SqliteSession { conn: Some(conn) }))
    }
}

/// Session holding one SQLite connection until closed.
pub struct SqliteSession {
    conn: Option<Connection>,
}

impl SqliteSession {
    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }
}

impl Session for SqliteSession {
    fn begin(&mut self) -> StoreResult<()> {
        self.conn()?.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            return Err(StoreError::NoActiveTransaction);
        }
        conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK;")?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                warn!("event=session_close module=store status=error driver=sqlite error={err}");
            }
        }
    }

    fn insert_multi(&mut self, items: &[InsertItem]) -> StoreResult<u64> {
        let conn = self.conn()?;
        let mut inserted = 0;
        for item in items {
            ensure_identifier(&item.table)?;
            if item.fields.is_empty() {
                return Err(StoreError::EmptyWrite {
                    table: item.table.clone(),
                });
            }

            let mut columns = Vec::with_capacity(item.fields.len());
            let mut placeholders = Vec::with_capacity(item.fields.len());
            for (index, column) in item.fields.keys().enumerate() {
                ensure_identifier(column)?;
                columns.push(format!("\"{column}\""));
                placeholders.push(format!("?{}", index + 1));
            }

            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({});",
                item.table,
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            inserted += stmt.execute(params_from_iter(item.fields.values()))? as u64;
        }
        Ok(inserted)
    }

    fn update(&mut self, table: &str, filters: &Fields, params: &Fields) -> StoreResult<u64> {
        ensure_identifier(table)?;
        ensure_filtered(table, filters)?;
        if params.is_empty() {
            return Err(StoreError::EmptyWrite {
                table: table.to_string(),
            });
        }

        let mut binds: Vec<&Value> = Vec::new();
        let mut assignments = Vec::with_capacity(params.len());
        for (column, value) in params {
            ensure_identifier(column)?;
            binds.push(value);
            assignments.push(format!("\"{column}\" = ?{}", binds.len()));
        }
        let predicate = where_clause(filters, &mut binds)?;

        let sql = format!(
            "UPDATE \"{table}\" SET {} WHERE {predicate};",
            assignments.join(", ")
        );
        let changed = self.conn()?.execute(&sql, params_from_iter(binds))?;
        Ok(changed as u64)
    }

    fn delete(&mut self, table: &str, filters: &Fields) -> StoreResult<u64> {
        ensure_identifier(table)?;
        ensure_filtered(table, filters)?;

        let mut binds: Vec<&Value> = Vec::new();
        let predicate = where_clause(filters, &mut binds)?;
        let sql = format!("DELETE FROM \"{table}\" WHERE {predicate};");
        let changed = self.conn()?.execute(&sql, params_from_iter(binds))?;
        Ok(changed as u64)
    }

    fn find(&mut self, table: &str, filters: &Fields) -> StoreResult<Vec<Fields>> {
        ensure_identifier(table)?;

        let mut binds: Vec<&Value> = Vec::new();
        let sql = if filters.is_empty() {
            format!("SELECT * FROM \"{table}\" ORDER BY rowid ASC;")
        } else {
            let predicate = where_clause(filters, &mut binds)?;
            format!("SELECT * FROM \"{table}\" WHERE {predicate} ORDER BY rowid ASC;")
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();

        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut found = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Fields::new();
            for (index, column) in columns.iter().enumerate() {
                record.insert(column.clone(), value_from_ref(row.get_ref(index)?));
            }
            found.push(record);
        }
        Ok(found)
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(value) => ToSqlOutput::Owned(SqlValue::Integer(*value)),
            Value::Real(value) => ToSqlOutput::Owned(SqlValue::Real(*value)),
            Value::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Value::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value.as_slice())),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Integer(value),
        ValueRef::Real(value) => Value::Real(value),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

fn where_clause<'v>(filters: &'v Fields, binds: &mut Vec<&'v Value>) -> StoreResult<String> {
    let mut predicates = Vec::with_capacity(filters.len());
    for (column, value) in filters {
        ensure_identifier(column)?;
        if value.is_null() {
            predicates.push(format!("\"{column}\" IS NULL"));
        } else {
            binds.push(value);
            predicates.push(format!("\"{column}\" = ?{}", binds.len()));
        }
    }
    Ok(predicates.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::SqliteEngine;
    use crate::store::{fields, EngineHandle, InsertItem, StoreError, Value};

    fn engine_with_users() -> (tempfile::TempDir, SqliteEngine) {
        let dir = tempfile::tempdir().expect("temp dir");
        let engine = SqliteEngine::new(dir.path().join("users.db"));
        engine
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);",
            )
            .expect("schema should apply");
        (dir, engine)
    }

    #[test]
    fn crud_primitives_roundtrip_through_one_session() {
        let (_dir, engine) = engine_with_users();
        let mut session = engine.new_session().expect("session");

        let inserted = session
            .insert_multi(&[
                InsertItem::new("users").field("name", "ada"),
                InsertItem::new("users")
                    .field("name", "bob")
                    .field("email", "bob@example.com"),
            ])
            .expect("insert");
        assert_eq!(inserted, 2);

        let no_email = session
            .find("users", &fields([("email", Value::Null)]))
            .expect("find by null");
        assert_eq!(no_email.len(), 1);
        assert_eq!(no_email[0]["name"].as_text(), Some("ada"));

        let updated = session
            .update(
                "users",
                &fields([("name", "ada")]),
                &fields([("email", "ada@example.com")]),
            )
            .expect("update");
        assert_eq!(updated, 1);

        let deleted = session
            .delete("users", &fields([("name", "bob")]))
            .expect("delete");
        assert_eq!(deleted, 1);

        let all = session.find("users", &fields::<&str, Value, _>([])).expect("find all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["email"].as_text(), Some("ada@example.com"));
    }

    #[test]
    fn rollback_discards_uncommitted_rows() {
        let (_dir, engine) = engine_with_users();
        let mut session = engine.new_session().expect("session");
        session.begin().expect("begin");
        session
            .insert_multi(&[InsertItem::new("users").field("name", "ghost")])
            .expect("insert");
        session.rollback().expect("rollback");
        session.close();

        let mut reader = engine.new_session().expect("reader");
        let rows = reader.find("users", &fields::<&str, Value, _>([])).expect("find");
        assert!(rows.is_empty());
    }

    #[test]
    fn commit_without_begin_fails_and_closed_session_rejects_work() {
        let (_dir, engine) = engine_with_users();
        let mut session = engine.new_session().expect("session");
        let err = session.commit().expect_err("commit without begin");
        assert!(matches!(err, StoreError::NoActiveTransaction));

        session.close();
        session.close();
        let err = session.begin().expect_err("closed session");
        assert!(matches!(err, StoreError::Closed));
    }

    #[test]
    fn rejects_injection_in_identifiers() {
        let (_dir, engine) = engine_with_users();
        let mut session = engine.new_session().expect("session");
        let err = session
            .find("users; DROP TABLE users", &fields([("name", "x")]))
            .expect_err("bad table name");
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
    }
}
