//! In-memory datastore.
//!
//! Rows live in per-kind tables behind one mutex. Transactions buffer their
//! writes in a private overlay that becomes visible at commit; every written
//! row and every row read with [`LockMode::PessimisticWrite`] is locked for
//! the transaction until it commits, rolls back or is dropped.

use keel_core::{
    ColumnGuard, ColumnUpdate, Datastore, DatastoreTransaction, EntityKey, Error, LockMode,
    Result, Row, StorageErrorKind, TypeError, Value,
};
use keel_locking::{Clock, SystemClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read counters for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Every read call (plain and locking).
    pub reads: usize,
    /// Reads that requested pessimistic row locks.
    pub locking_reads: usize,
}

#[derive(Debug, Default)]
struct Table {
    primary_key: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    fn pk_of(&self, row: &Row) -> Result<Vec<Value>> {
        self.primary_key
            .iter()
            .map(|col| {
                row.get_by_name(col).cloned().ok_or_else(|| {
                    Error::TypeMismatch(TypeError::new("primary key", "missing").in_column(col))
                })
            })
            .collect()
    }

    fn position(&self, pk: &[Value]) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| self.pk_of(row).is_ok_and(|row_pk| row_pk == pk))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    /// Row lock owner per row.
    locks: HashMap<EntityKey, u64>,
    stats: HashMap<String, ReadStats>,
    server_time_requests: Vec<String>,
}

impl MemoryState {
    fn table(&self, kind: &str) -> Result<&Table> {
        self.tables.get(kind).ok_or_else(|| {
            Error::storage(StorageErrorKind::NotFound, format!("no table '{kind}'"))
        })
    }

    fn count_read(&mut self, kind: &str, lock: LockMode) {
        let stats = self.stats.entry(kind.to_string()).or_default();
        stats.reads += 1;
        if lock == LockMode::PessimisticWrite {
            stats.locking_reads += 1;
        }
    }

    fn lock_row(&mut self, key: &EntityKey, owner: u64) -> Result<()> {
        match self.locks.get(key) {
            Some(holder) if *holder != owner => Err(Error::storage(
                StorageErrorKind::Locked,
                format!("{key} is locked by transaction {holder}"),
            )),
            _ => {
                self.locks.insert(key.clone(), owner);
                Ok(())
            }
        }
    }

    fn release_locks(&mut self, owner: u64) {
        self.locks.retain(|_, holder| *holder != owner);
    }
}

/// A [`Datastore`] keeping all rows in memory.
#[derive(Debug)]
pub struct MemoryDatastore {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    next_transaction: AtomicU64,
}

impl MemoryDatastore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock: Arc::new(SystemClock),
            next_transaction: AtomicU64::new(1),
        }
    }

    /// Use `clock` as the server clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create (or reset) the table of `kind`.
    pub fn define_table(&self, kind: &str, primary_key: &[&str]) {
        self.state.lock().tables.insert(
            kind.to_string(),
            Table {
                primary_key: primary_key.iter().map(|c| (*c).to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Insert a committed row directly, outside any transaction.
    pub fn seed(&self, kind: &str, row: Row) -> Result<()> {
        let mut state = self.state.lock();
        let table = state.tables.get_mut(kind).ok_or_else(|| {
            Error::storage(StorageErrorKind::NotFound, format!("no table '{kind}'"))
        })?;
        let pk = table.pk_of(&row)?;
        if table.position(&pk).is_some() {
            return Err(Error::storage(
                StorageErrorKind::Constraint,
                format!("duplicate key in '{kind}'"),
            ));
        }
        table.rows.push(row);
        Ok(())
    }

    /// The committed row, without counting a read.
    pub fn committed_row(&self, kind: &str, pk: &[Value]) -> Option<Row> {
        let state = self.state.lock();
        let table = state.tables.get(kind)?;
        table.position(pk).map(|i| table.rows[i].clone())
    }

    pub fn read_stats(&self, kind: &str) -> ReadStats {
        self.state
            .lock()
            .stats
            .get(kind)
            .copied()
            .unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats.clear();
    }

    /// Session names that asked for the server clock, in order.
    pub fn server_time_requests(&self) -> Vec<String> {
        self.state.lock().server_time_requests.clone()
    }

    pub fn is_locked(&self, kind: &str, pk: &[Value]) -> bool {
        self.state
            .lock()
            .locks
            .contains_key(&EntityKey::new(kind, pk.to_vec()))
    }
}

impl Datastore for MemoryDatastore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_row(&self, kind: &str, pk: &[Value]) -> Result<Option<Row>> {
        let mut state = self.state.lock();
        state.count_read(kind, LockMode::None);
        let table = state.table(kind)?;
        Ok(table.position(pk).map(|i| table.rows[i].clone()))
    }

    fn read_rows(&self, kind: &str, column: &str, value: &Value) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.count_read(kind, LockMode::None);
        let table = state.table(kind)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| row.get_by_name(column) == Some(value))
            .cloned()
            .collect())
    }

    fn timestamp_from_server(&self, session_name: &str) -> Result<Value> {
        self.state
            .lock()
            .server_time_requests
            .push(session_name.to_string());
        Ok(Value::Timestamp(self.clock.now_micros()))
    }

    fn begin_transaction(&self) -> Result<Box<dyn DatastoreTransaction>> {
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(datastore = %self.name, transaction = id, "Beginning transaction");
        Ok(Box::new(MemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            overlay: Vec::new(),
            finished: false,
        }))
    }
}

/// Buffered write: the row's new content, or `None` once deleted.
type OverlayEntry = (EntityKey, Option<Row>);

struct MemoryTransaction {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    overlay: Vec<OverlayEntry>,
    finished: bool,
}

impl MemoryTransaction {
    fn overlay_entry(&self, key: &EntityKey) -> Option<&Option<Row>> {
        self.overlay
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, row)| row)
    }

    fn put(&mut self, key: EntityKey, row: Option<Row>) {
        match self.overlay.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = row,
            None => self.overlay.push((key, row)),
        }
    }

    /// The row as this transaction sees it.
    fn visible_row(&self, state: &MemoryState, key: &EntityKey) -> Result<Option<Row>> {
        if let Some(buffered) = self.overlay_entry(key) {
            return Ok(buffered.clone());
        }
        let table = state.table(key.kind())?;
        Ok(table.position(key.pk()).map(|i| table.rows[i].clone()))
    }

    fn visible_rows(&self, state: &MemoryState, kind: &str) -> Result<Vec<(EntityKey, Row)>> {
        let table = state.table(kind)?;
        let mut rows = Vec::new();
        for row in &table.rows {
            let key = EntityKey::new(kind, table.pk_of(row)?);
            match self.overlay_entry(&key) {
                Some(Some(buffered)) => rows.push((key, buffered.clone())),
                Some(None) => {}
                None => rows.push((key, row.clone())),
            }
        }
        for (key, row) in &self.overlay {
            if key.kind() == kind && table.position(key.pk()).is_none() {
                if let Some(row) = row {
                    rows.push((key.clone(), row.clone()));
                }
            }
        }
        Ok(rows)
    }

    fn apply(&self, row: &mut Row, assignments: &[(String, ColumnUpdate)]) -> Result<()> {
        for (column, update) in assignments {
            let value = match update {
                ColumnUpdate::Value(v) => v.clone(),
                ColumnUpdate::CurrentTimestamp => Value::Timestamp(self.clock.now_micros()),
                ColumnUpdate::Increment(delta) => {
                    let current = row.get_by_name(column).cloned().unwrap_or(Value::Null);
                    let base = match &current {
                        Value::Null => 0,
                        other => other.as_i64().ok_or_else(|| {
                            Error::TypeMismatch(
                                TypeError::new("integer", other.type_name()).in_column(column),
                            )
                        })?,
                    };
                    Value::BigInt(base + delta)
                }
            };
            row.set(column, value);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::storage(
                StorageErrorKind::Transaction,
                format!("transaction {} already finished", self.id),
            ));
        }
        Ok(())
    }
}

fn matches_guard(row: &Row, guard: Option<&ColumnGuard>) -> bool {
    guard.is_none_or(|g| row.get_by_name(&g.column).unwrap_or(&Value::Null) == &g.value)
}

impl DatastoreTransaction for MemoryTransaction {
    fn read_row(&mut self, kind: &str, pk: &[Value], lock: LockMode) -> Result<Option<Row>> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        state.count_read(kind, lock);
        let key = EntityKey::new(kind, pk.to_vec());
        let row = self.visible_row(&state, &key)?;
        if lock == LockMode::PessimisticWrite && row.is_some() {
            state.lock_row(&key, self.id)?;
            tracing::trace!(transaction = self.id, key = %key, "Locked row for read");
        }
        Ok(row)
    }

    fn read_rows(
        &mut self,
        kind: &str,
        column: &str,
        value: &Value,
        lock: LockMode,
    ) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        state.count_read(kind, lock);
        let matching: Vec<(EntityKey, Row)> = self
            .visible_rows(&state, kind)?
            .into_iter()
            .filter(|(_, row)| row.get_by_name(column) == Some(value))
            .collect();
        if lock == LockMode::PessimisticWrite {
            for (key, _) in &matching {
                state.lock_row(key, self.id)?;
            }
        }
        Ok(matching.into_iter().map(|(_, row)| row).collect())
    }

    fn insert_row(&mut self, kind: &str, row: Row) -> Result<()> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        let key = EntityKey::new(kind, state.table(kind)?.pk_of(&row)?);
        if self.visible_row(&state, &key)?.is_some() {
            return Err(Error::storage(
                StorageErrorKind::Constraint,
                format!("duplicate key {key}"),
            ));
        }
        state.lock_row(&key, self.id)?;
        drop(state);
        self.put(key, Some(row));
        Ok(())
    }

    fn update_row(
        &mut self,
        kind: &str,
        pk: &[Value],
        assignments: &[(String, ColumnUpdate)],
        guard: Option<&ColumnGuard>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        let key = EntityKey::new(kind, pk.to_vec());
        let Some(mut row) = self.visible_row(&state, &key)? else {
            return Ok(0);
        };
        state.lock_row(&key, self.id)?;
        if !matches_guard(&row, guard) {
            return Ok(0);
        }
        drop(state);
        self.apply(&mut row, assignments)?;
        self.put(key, Some(row));
        Ok(1)
    }

    fn delete_row(
        &mut self,
        kind: &str,
        pk: &[Value],
        guard: Option<&ColumnGuard>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        let key = EntityKey::new(kind, pk.to_vec());
        let Some(row) = self.visible_row(&state, &key)? else {
            return Ok(0);
        };
        state.lock_row(&key, self.id)?;
        if !matches_guard(&row, guard) {
            return Ok(0);
        }
        drop(state);
        self.put(key, None);
        Ok(1)
    }

    fn update_all(
        &mut self,
        kind: &str,
        filter: Option<&ColumnGuard>,
        assignments: &[(String, ColumnUpdate)],
    ) -> Result<u64> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        let targets: Vec<(EntityKey, Row)> = self
            .visible_rows(&state, kind)?
            .into_iter()
            .filter(|(_, row)| matches_guard(row, filter))
            .collect();
        for (key, _) in &targets {
            state.lock_row(key, self.id)?;
        }
        drop(state);
        let mut count = 0;
        for (key, mut row) in targets {
            self.apply(&mut row, assignments)?;
            self.put(key, Some(row));
            count += 1;
        }
        Ok(count)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        for (key, row) in std::mem::take(&mut self.overlay) {
            let table = state.tables.get_mut(key.kind()).ok_or_else(|| {
                Error::storage(
                    StorageErrorKind::NotFound,
                    format!("no table '{}'", key.kind()),
                )
            })?;
            match (table.position(key.pk()), row) {
                (Some(i), Some(row)) => table.rows[i] = row,
                (Some(i), None) => {
                    table.rows.remove(i);
                }
                (None, Some(row)) => table.rows.push(row),
                (None, None) => {}
            }
        }
        state.release_locks(self.id);
        self.finished = true;
        tracing::debug!(transaction = self.id, "Committed transaction");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        self.overlay.clear();
        self.state.lock().release_locks(self.id);
        self.finished = true;
        tracing::debug!(transaction = self.id, "Rolled back transaction");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.state.lock().release_locks(self.id);
        }
    }
}
