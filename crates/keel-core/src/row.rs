//! Rows exchanged with a datastore.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows read from the same table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row: an ordered set of named column values.
///
/// Lock markers travel in rows too, so [`Row::get_by_name`] is how the
/// locking policy finds the version column of a freshly read row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Build a row from `(column, value)` pairs, preserving their order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self::new(names, values)
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    /// Assign `value` to column `name`, appending the column if the row
    /// does not have it yet.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(i) = self.columns.index_of(name) {
            self.values[i] = value;
            return;
        }
        let mut names = self.columns.names.clone();
        names.push(name.to_string());
        self.columns = Arc::new(ColumnInfo::new(names));
        self.values.push(value);
    }

    /// Get a typed value by column name.
    ///
    /// A missing column is reported as a type error naming the column, the
    /// same way a value of the wrong kind is.
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::TypeMismatch(TypeError::new("column", "missing").in_column(name))
        })?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::TypeMismatch(te) => Error::TypeMismatch(te.in_column(name)),
            other => other,
        })
    }

    /// Iterate over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Turn the row back into owned `(column, value)` pairs.
    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.columns.names.iter().cloned().zip(self.values).collect()
    }
}
