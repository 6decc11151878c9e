//! Storage collaborator traits.
//!
//! A [`Datastore`] stores rows keyed by entity kind and primary key. Writes
//! always happen inside a [`DatastoreTransaction`]; plain reads may happen
//! outside one.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// Row locking requested by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Plain read.
    #[default]
    None,
    /// Lock the rows for the rest of the transaction (`SELECT ... FOR UPDATE`).
    PessimisticWrite,
}

/// One assignment in an update.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnUpdate {
    /// Store this literal value.
    Value(Value),
    /// Store the datastore's current time.
    CurrentTimestamp,
    /// Add to the stored integer.
    Increment(i64),
}

/// A row predicate on one column, used to guard and filter writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnGuard {
    pub column: String,
    pub value: Value,
}

impl ColumnGuard {
    pub fn new(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// A store of rows.
pub trait Datastore: Send + Sync {
    /// Name used in diagnostics and when asking the server for its clock.
    fn name(&self) -> &str;

    /// Read one row by primary key outside any transaction.
    fn read_row(&self, kind: &str, pk: &[Value]) -> Result<Option<Row>>;

    /// Read every row of `kind` whose `column` equals `value`.
    fn read_rows(&self, kind: &str, column: &str, value: &Value) -> Result<Vec<Row>>;

    /// The datastore server's current time as a [`Value::Timestamp`].
    ///
    /// `session_name` names the outermost session asking.
    fn timestamp_from_server(&self, session_name: &str) -> Result<Value>;

    fn begin_transaction(&self) -> Result<Box<dyn DatastoreTransaction>>;
}

/// An open storage transaction.
pub trait DatastoreTransaction: Send {
    fn read_row(&mut self, kind: &str, pk: &[Value], lock: LockMode) -> Result<Option<Row>>;

    fn read_rows(
        &mut self,
        kind: &str,
        column: &str,
        value: &Value,
        lock: LockMode,
    ) -> Result<Vec<Row>>;

    fn insert_row(&mut self, kind: &str, row: Row) -> Result<()>;

    /// Apply `assignments` to the row `pk` if it also matches `guard`.
    ///
    /// Returns the number of rows changed: zero means the row is gone or the
    /// guard did not match.
    fn update_row(
        &mut self,
        kind: &str,
        pk: &[Value],
        assignments: &[(String, ColumnUpdate)],
        guard: Option<&ColumnGuard>,
    ) -> Result<u64>;

    /// Delete the row `pk` if it matches `guard`. Returns rows deleted.
    fn delete_row(&mut self, kind: &str, pk: &[Value], guard: Option<&ColumnGuard>)
    -> Result<u64>;

    /// Apply `assignments` to every row of `kind` matching `filter`.
    fn update_all(
        &mut self,
        kind: &str,
        filter: Option<&ColumnGuard>,
        assignments: &[(String, ColumnUpdate)],
    ) -> Result<u64>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
