//! Deferred write batch returned by logic phases.
//!
//! # Invariants
//! - Items are applied in the order inserts, updates, deletes.
//! - A batch is applied through the same session as the logic that built it.

use super::{Fields, Session, StoreResult, Value};
use log::debug;

/// One row to insert into `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertItem {
    pub table: String,
    pub fields: Fields,
}

impl InsertItem {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Fields::new(),
        }
    }

    /// Adds one column value.
    pub fn field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }
}

/// Sets `params` on rows of `table` matching `filters`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItem {
    pub table: String,
    pub filters: Fields,
    pub params: Fields,
}

/// Deletes rows of `table` matching `filters`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteItem {
    pub table: String,
    pub filters: Fields,
}

/// Row counts produced by applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Write operations collected during the logic phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub inserts: Vec<InsertItem>,
    pub updates: Vec<UpdateItem>,
    pub deletes: Vec<DeleteItem>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_insert(&mut self, item: InsertItem) -> &mut Self {
        self.inserts.push(item);
        self
    }

    pub fn append_update(&mut self, item: UpdateItem) -> &mut Self {
        self.updates.push(item);
        self
    }

    pub fn append_delete(&mut self, item: DeleteItem) -> &mut Self {
        self.deletes.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Moves every item of `other` to the end of this batch.
    pub fn extend(&mut self, other: WriteBatch) {
        self.inserts.extend(other.inserts);
        self.updates.extend(other.updates);
        self.deletes.extend(other.deletes);
    }

    /// Applies the batch through `session`.
    ///
    /// Stops at the first failing item; the caller decides whether to roll
    /// back.
    pub fn apply(&self, session: &mut dyn Session) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();
        if self.is_empty() {
            return Ok(report);
        }

        if !self.inserts.is_empty() {
            report.inserted = session.insert_multi(&self.inserts)?;
        }
        for item in &self.updates {
            report.updated += session.update(&item.table, &item.filters, &item.params)?;
        }
        for item in &self.deletes {
            report.deleted += session.delete(&item.table, &item.filters)?;
        }

        debug!(
            "event=batch_apply module=store status=ok inserted={} updated={} deleted={}",
            report.inserted, report.updated, report.deleted
        );
        Ok(report)
    }
}
