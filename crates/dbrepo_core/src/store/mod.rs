//! Data-store capability consumed by the transaction layer.
//!
//! # Responsibility
//! - Define the narrow `Session` / `EngineHandle` contracts the orchestrator
//!   drives (begin/commit/rollback/close plus row-level primitives).
//! - Provide the shared row value model used by sessions and write batches.
//!
//! # Invariants
//! - A session is closed at most once; operations after close fail with
//!   `StoreError::Closed`.
//! - Table and column names are validated before any SQL is built.
//! - Update/delete never run without at least one filter.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod batch;
pub mod memory;
pub mod sqlite;

pub use batch::{DeleteItem, InsertItem, UpdateItem, WriteBatch};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

pub type StoreResult<T> = Result<T, StoreError>;

/// Column name to value mapping used for rows, filters and update params.
pub type Fields = BTreeMap<String, Value>;

/// Dynamically typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Integer(if value { 1 } else { 0 })
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Builds a `Fields` map from `(column, value)` pairs.
pub fn fields<K, V, I>(pairs: I) -> Fields
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// Errors raised by store engines and sessions.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
    /// Session was already closed.
    Closed,
    /// Table or column name is not a plain identifier.
    InvalidIdentifier(String),
    /// Update/delete without filters.
    UnfilteredWrite { table: String },
    /// Write carries no columns.
    EmptyWrite { table: String },
    /// Commit requested with no transaction in progress.
    NoActiveTransaction,
    /// Failure injected by a test engine.
    Injected(&'static str),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Closed => write!(f, "session is closed"),
            Self::InvalidIdentifier(value) => write!(f, "invalid identifier `{value}`"),
            Self::UnfilteredWrite { table } => {
                write!(f, "refusing unfiltered write on table `{table}`")
            }
            Self::EmptyWrite { table } => write!(f, "write on table `{table}` has no columns"),
            Self::NoActiveTransaction => write!(f, "no active transaction"),
            Self::Injected(operation) => write!(f, "injected failure during {operation}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// One open unit of access to a store engine.
///
/// Sessions are exclusively owned by the context that opened them and are
/// driven synchronously.
pub trait Session: Send {
    /// Starts a store-level transaction.
    fn begin(&mut self) -> StoreResult<()>;
    /// Commits the store-level transaction.
    fn commit(&mut self) -> StoreResult<()>;
    /// Rolls back the store-level transaction, if any.
    fn rollback(&mut self) -> StoreResult<()>;
    /// Releases the session. Idempotent.
    fn close(&mut self);
    /// Inserts every item, returning the number of inserted rows.
    fn insert_multi(&mut self, items: &[InsertItem]) -> StoreResult<u64>;
    /// Sets `params` on rows matching `filters`.
    fn update(&mut self, table: &str, filters: &Fields, params: &Fields) -> StoreResult<u64>;
    /// Deletes rows matching `filters`.
    fn delete(&mut self, table: &str, filters: &Fields) -> StoreResult<u64>;
    /// Loads rows matching `filters` (all rows when empty).
    fn find(&mut self, table: &str, filters: &Fields) -> StoreResult<Vec<Fields>>;
}

/// A configured store engine able to open sessions.
pub trait EngineHandle: Send + Sync {
    /// Short driver label used in log events.
    fn driver(&self) -> &'static str;
    /// Opens a new, caller-owned session.
    fn new_session(&self) -> StoreResult<Box<dyn Session>>;
}

pub(crate) fn ensure_identifier(value: &str) -> StoreResult<()> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(value.to_string()))
    }
}

pub(crate) fn ensure_filtered(table: &str, filters: &Fields) -> StoreResult<()> {
    if filters.is_empty() {
        return Err(StoreError::UnfilteredWrite {
            table: table.to_string(),
        });
    }
    Ok(())
}

/// Returns true when `row` matches every filter by equality.
pub(crate) fn row_matches(row: &Fields, filters: &Fields) -> bool {
    filters.iter().all(|(column, expected)| match row.get(column) {
        Some(actual) => actual == expected,
        None => expected.is_null(),
    })
}

#[cfg(test)]
mod tests {
    use super::{ensure_filtered, ensure_identifier, fields, row_matches, StoreError, Value};

    #[test]
    fn identifiers_reject_quotes_and_spaces() {
        assert!(ensure_identifier("user_accounts").is_ok());
        assert!(ensure_identifier("_x1").is_ok());
        for bad in ["", "1users", "users; drop", "na\"me", "a b"] {
            let err = ensure_identifier(bad).expect_err("identifier should be rejected");
            assert!(matches!(err, StoreError::InvalidIdentifier(_)));
        }
    }

    #[test]
    fn unfiltered_writes_are_rejected() {
        let err = ensure_filtered("users", &fields::<&str, Value, _>([]))
            .expect_err("empty filters must fail");
        assert!(matches!(err, StoreError::UnfilteredWrite { .. }));
    }

    #[test]
    fn null_filter_matches_missing_column() {
        let row = fields([("name", Value::from("ada"))]);
        assert!(row_matches(&row, &fields([("name", "ada")])));
        assert!(row_matches(&row, &fields([("email", Value::Null)])));
        assert!(!row_matches(&row, &fields([("name", "bob")])));
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::Integer(3));
        assert_eq!(Value::from(true), Value::Integer(1));
    }
}
