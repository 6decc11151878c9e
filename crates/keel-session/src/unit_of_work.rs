//! Units of work: transaction-private working copies over a shared cache.
//!
//! A [`UnitOfWork`] reads originals through its [`SharedSession`] and hands
//! out clones whose relationship references are wrapped in working-copy
//! decorators. Nothing the caller does to a working copy is visible outside
//! the unit of work until [`commit`](UnitOfWork::commit):
//!
//! 1. Pending writes are computed from new, changed and deleted working
//!    copies and ordered by entity dependencies.
//! 2. Lock-guarded writes check their marker against the shared cache,
//!    compute the next marker and are guarded by the marker they read.
//! 3. The storage transaction commits.
//! 4. Written working copies are merged back into the shared cache.
//!
//! Any failure before step 3 rolls the storage transaction back and leaves
//! the shared cache untouched.

use crate::change_tracker::ChangeTracker;
use crate::commit::{CommitManager, CommitOrderer, CommitPlan, CommitSummary, PendingOp};
use crate::descriptor::EntityDescriptor;
use crate::identity_map::IdentityMap;
use crate::shared::SharedSession;
use crate::working_copy::{
    CloneStrategy, PlainClone, TransportedReference, WorkingCopyLazyReference,
};
use keel_core::{
    ColumnGuard, ColumnUpdate, ConcurrencyViolation, Datastore, DatastoreTransaction, Entity,
    EntityKey, Error, ErasedEntity, HolderMapper, LoadContext, LockMarker, LockMode, Managed,
    Result, Row, SessionChain, TransactionScope, Value, ValueHolder, ViolationReason,
};
use keel_locking::OptimisticLockPolicy;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Open,
    Committed,
    Released,
}

/// Counts of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct UnitState {
    tracker: ChangeTracker,
    /// Marker of each working copy as read (or last written).
    read_markers: HashMap<EntityKey, Option<LockMarker>>,
    new_objects: Vec<EntityKey>,
    deleted: Vec<EntityKey>,
    status: UnitStatus,
}

/// Wraps every shared reference of an original in a working-copy decorator.
struct DecorateForWorkingCopy<'a> {
    owner: &'a Weak<UnitOfWork>,
    source: &'a EntityKey,
    descriptor: Option<&'a EntityDescriptor>,
}

impl HolderMapper for DecorateForWorkingCopy<'_> {
    fn map<T: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        attribute: &'static str,
        holder: &ValueHolder<T>,
    ) -> Result<ValueHolder<T>> {
        let ValueHolder::Shared(lazy) = holder else {
            return Err(Error::invalid_state(format!(
                "{}.{attribute} already holds a working copy reference",
                self.source
            )));
        };
        let strategy = self.descriptor.map_or_else(
            || Arc::new(PlainClone) as Arc<dyn CloneStrategy<T>>,
            |d| d.clone_strategy_for::<T>(attribute),
        );
        Ok(ValueHolder::Decorated(Arc::new(WorkingCopyLazyReference::new(
            lazy,
            self.owner.clone(),
            self.source.clone(),
            attribute,
            strategy,
        ))))
    }
}

/// A transaction's private view of the shared cache.
pub struct UnitOfWork {
    name: String,
    parent: Arc<SharedSession>,
    self_ref: Weak<UnitOfWork>,
    resume_after_commit: bool,
    objects: parking_lot::RwLock<IdentityMap>,
    state: Mutex<UnitState>,
    commit_manager: CommitManager,
    transaction: Mutex<Option<Box<dyn DatastoreTransaction>>>,
    begun_early: AtomicBool,
}

impl UnitOfWork {
    pub(crate) fn new(parent: Arc<SharedSession>, name: String, resume_after_commit: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name,
            parent,
            self_ref: self_ref.clone(),
            resume_after_commit,
            objects: parking_lot::RwLock::new(IdentityMap::new()),
            state: Mutex::new(UnitState {
                tracker: ChangeTracker::new(),
                read_markers: HashMap::new(),
                new_objects: Vec::new(),
                deleted: Vec::new(),
                status: UnitStatus::Open,
            }),
            commit_manager: CommitManager::new(),
            transaction: Mutex::new(None),
            begun_early: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared_session(&self) -> &Arc<SharedSession> {
        &self.parent
    }

    pub fn commit_manager(&self) -> &CommitManager {
        &self.commit_manager
    }

    pub fn status(&self) -> UnitStatus {
        self.state.lock().status
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status() {
            UnitStatus::Open => Ok(()),
            other => Err(Error::invalid_state(format!(
                "unit of work {} is {other:?}",
                self.name
            ))),
        }
    }

    fn policy_for(&self, kind: &str) -> Option<OptimisticLockPolicy> {
        self.parent
            .descriptor(kind)
            .and_then(|d| d.lock_policy().cloned())
    }

    // ==================== Working copies ====================

    /// Read the working copy of `E` with primary key `pk`.
    ///
    /// The first read clones the shared original; later reads return the
    /// same working copy. Deleted objects read as `None`.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.name, kind = E::KIND))]
    pub fn read<E: Entity>(&self, pk: &[Value]) -> Result<Option<Managed<E>>> {
        self.ensure_open()?;
        let key = EntityKey::new(E::KIND, pk.to_vec());
        if self.state.lock().deleted.contains(&key) {
            return Ok(None);
        }
        if let Some(existing) = self.objects.read().get::<E>(pk) {
            return Ok(Some(existing));
        }
        let Some(original) = self.parent.read::<E>(pk)? else {
            return Ok(None);
        };
        self.register_clone(&original).map(Some)
    }

    fn register_clone<E: Entity>(&self, original: &Managed<E>) -> Result<Managed<E>> {
        let snapshot = original.read().clone();
        let key = snapshot.key();
        let descriptor = self.parent.descriptor(E::KIND);
        let working = snapshot.map_holders(&DecorateForWorkingCopy {
            owner: &self.self_ref,
            source: &key,
            descriptor: descriptor.as_deref(),
        })?;

        let row = Row::from_pairs(working.to_row());
        let marker = match descriptor.as_ref().and_then(|d| d.lock_policy()) {
            Some(policy) => policy.write_lock_value(&row, &key, &*self.parent)?,
            None => None,
        };

        let managed = self.objects.write().get_or_insert(working);
        let mut state = self.state.lock();
        if !state.tracker.has_snapshot(&key) {
            state.tracker.snapshot(key.clone(), &row)?;
            state.read_markers.insert(key.clone(), marker);
        }
        tracing::trace!(key = %key, marker = ?marker, "Registered working copy");
        Ok(managed)
    }

    /// Register a new object, inserted at commit.
    ///
    /// Relationship holders of new objects are kept as given; they are not
    /// decorated.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(unit = %self.name, kind = E::KIND))]
    pub fn register_new<E: Entity>(&self, entity: E) -> Result<Managed<E>> {
        self.ensure_open()?;
        let key = entity.key();
        if self.objects.read().contains(&key) {
            return Err(Error::invalid_state(format!(
                "{key} is already registered in {}",
                self.name
            )));
        }
        let managed = self.objects.write().insert(entity);
        let mut state = self.state.lock();
        state.deleted.retain(|k| *k != key);
        state.new_objects.push(key);
        Ok(managed)
    }

    /// Mark the object `pk` for deletion. Returns `false` if it does not
    /// exist.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.name, kind = E::KIND))]
    pub fn delete<E: Entity>(&self, pk: &[Value]) -> Result<bool> {
        self.ensure_open()?;
        let key = EntityKey::new(E::KIND, pk.to_vec());
        {
            let mut state = self.state.lock();
            if let Some(pos) = state.new_objects.iter().position(|k| *k == key) {
                state.new_objects.remove(pos);
                drop(state);
                self.objects.write().remove(&key);
                return Ok(true);
            }
            if state.deleted.contains(&key) {
                return Ok(true);
            }
        }
        if self.read::<E>(pk)?.is_none() {
            return Ok(false);
        }
        self.state.lock().deleted.push(key);
        Ok(true)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.objects.read().contains(key)
    }

    /// Rebuild a transported reference inside this unit of work.
    ///
    /// The holder is severed; it resolves through the shared cache until
    /// reattached.
    pub fn receive_reference<T: Clone + PartialEq + Send + Sync + 'static>(
        self: &Arc<Self>,
        transported: TransportedReference,
    ) -> ValueHolder<T> {
        ValueHolder::Decorated(Arc::new(WorkingCopyLazyReference::<T>::from_transport(
            transported,
            self,
        )))
    }

    /// Counts of what a commit would write now.
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        let plan = self.build_plan()?;
        Ok(PendingCounts {
            new: plan.inserts.len(),
            dirty: plan.updates.len(),
            deleted: plan.deletes.len(),
        })
    }

    // ==================== Transactions ====================

    /// Open the storage transaction now, before commit. Reads through the
    /// transaction (such as pessimistic relationship reads) then hold their
    /// locks until commit or rollback.
    pub fn begin_early_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.transaction.lock();
        if slot.is_none() {
            *slot = Some(self.parent.datastore().begin_transaction()?);
            self.begun_early.store(true, Ordering::SeqCst);
            tracing::debug!(unit = %self.name, "Began transaction early");
        }
        Ok(())
    }

    pub fn has_open_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    fn rollback_open_transaction(&self) {
        let open = self.transaction.lock().take();
        self.begun_early.store(false, Ordering::SeqCst);
        if let Some(tx) = open {
            if let Err(e) = tx.rollback() {
                tracing::warn!(unit = %self.name, error = %e, "Rollback failed");
            }
        }
    }

    /// Commit all changes. The unit of work stays open afterwards if the
    /// session is configured to resume after commit.
    pub fn commit(&self) -> Result<CommitSummary> {
        self.commit_with(self.resume_after_commit)
    }

    /// Commit all changes and keep the unit of work open.
    pub fn commit_and_resume(&self) -> Result<CommitSummary> {
        self.commit_with(true)
    }

    #[tracing::instrument(level = "info", skip(self), fields(unit = %self.name))]
    fn commit_with(&self, resume: bool) -> Result<CommitSummary> {
        self.ensure_open()?;
        self.commit_manager.begin()?;

        match self.commit_inner() {
            Ok(summary) => {
                if resume {
                    self.commit_manager.reset();
                } else {
                    self.commit_manager.complete();
                    self.state.lock().status = UnitStatus::Committed;
                }
                tracing::info!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    resume,
                    "Unit of work committed"
                );
                Ok(summary)
            }
            Err(e) => {
                self.rollback_open_transaction();
                self.commit_manager.fail();
                if let Some(violation) = e.as_concurrency_violation() {
                    tracing::warn!(
                        entity = %violation.entity,
                        reason = ?violation.reason,
                        expected = ?violation.expected,
                        found = ?violation.found,
                        "Optimistic lock violation; commit aborted"
                    );
                } else {
                    tracing::warn!(error = %e, "Commit failed");
                }
                Err(e)
            }
        }
    }

    fn commit_inner(&self) -> Result<CommitSummary> {
        let plan = self.build_plan()?;
        {
            // The transaction stays in its slot while the plan is written,
            // so references triggered meanwhile read through it.
            let mut slot = self.transaction.lock();
            if slot.is_none() {
                if plan.is_empty() {
                    return Ok(CommitSummary::default());
                }
                *slot = Some(self.parent.datastore().begin_transaction()?);
            }
        }

        let written = self.write_plan(&plan)?;
        let tx = self.transaction.lock().take().ok_or_else(|| {
            Error::invalid_state(format!("transaction of {} closed during commit", self.name))
        })?;
        self.begun_early.store(false, Ordering::SeqCst);
        tx.commit()?;

        let summary = CommitSummary {
            inserted: plan.inserts.len(),
            updated: plan.updates.len(),
            deleted: plan.deletes.len(),
        };
        let deleted: Vec<EntityKey> = plan.deletes.iter().map(|op| op.key().clone()).collect();
        if let Err(e) = self.merge_into_parent(&written, &deleted) {
            // Storage has the new state; the cache must not keep the old one.
            for (key, _) in &written {
                self.parent.invalidate(key);
            }
            return Err(e);
        }
        Ok(summary)
    }

    /// Compute the ordered writes for the current working copies.
    fn build_plan(&self) -> Result<CommitPlan> {
        let state = self.state.lock();
        let objects = self.objects.read();
        let mut ops = Vec::new();

        for key in &state.new_objects {
            let object = objects.get_object(key).ok_or_else(|| {
                Error::invalid_state(format!("new object {key} is missing from {}", self.name))
            })?;
            ops.push(PendingOp::Insert {
                key: key.clone(),
                row: object.row(),
            });
        }

        for object in objects.objects() {
            let key = object.key();
            if state.new_objects.contains(&key) || state.deleted.contains(&key) {
                continue;
            }
            // Relationship values are private clones; an edit to one would
            // never reach storage.
            if let Some(attribute) = object.edited_relationships()?.first() {
                return Err(Error::invalid_state(format!(
                    "{key}.{attribute} was edited through its relationship; \
                     edit the target's own working copy instead"
                )));
            }
            let row = object.row();
            let changed = state.tracker.changed_columns(&key, &row)?;
            if changed.is_empty() {
                continue;
            }
            let set_columns = changed
                .into_iter()
                .filter_map(|column| row.get_by_name(&column).cloned().map(|v| (column, v)))
                .collect();
            ops.push(PendingOp::Update { key, set_columns });
        }

        for key in &state.deleted {
            ops.push(PendingOp::Delete { key: key.clone() });
        }

        let mut orderer = CommitOrderer::new();
        for descriptor in self.parent.descriptors() {
            orderer.register_kind(descriptor.kind(), descriptor.dependencies());
        }
        orderer.check_cycles()?;
        Ok(orderer.order(ops))
    }

    /// Run `write` against the open storage transaction.
    fn with_transaction<R>(
        &self,
        write: impl FnOnce(&mut dyn DatastoreTransaction) -> Result<R>,
    ) -> Result<R> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("no open transaction in {}", self.name))
        })?;
        write(&mut **tx)
    }

    /// Execute `plan`; returns the written keys with their new markers.
    fn write_plan(&self, plan: &CommitPlan) -> Result<Vec<(EntityKey, Option<LockMarker>)>> {
        let read_markers = self.state.lock().read_markers.clone();
        let mut written = Vec::new();

        for op in plan.iter() {
            let policy = self.policy_for(op.kind());
            match op {
                PendingOp::Insert { key, row } => {
                    let mut row = row.clone();
                    let marker = match &policy {
                        Some(policy) => {
                            let marker = policy.initial_write_value(self)?;
                            row.set(policy.field(), marker.to_value());
                            Some(marker)
                        }
                        None => None,
                    };
                    tracing::trace!(key = %key, "Inserting row");
                    self.with_transaction(|tx| tx.insert_row(key.kind(), row))?;
                    written.push((key.clone(), marker));
                }
                PendingOp::Update { key, set_columns } => {
                    let expected = read_markers.get(key).copied().flatten();
                    let marker = self.write_update(key, set_columns, expected, policy.as_ref())?;
                    written.push((key.clone(), marker));
                }
                PendingOp::Delete { key } => {
                    let expected = read_markers.get(key).copied().flatten();
                    let guard = policy
                        .as_ref()
                        .map(|p| ColumnGuard::new(p.field(), marker_value(expected)));
                    tracing::trace!(key = %key, "Deleting row");
                    self.with_transaction(|tx| {
                        if tx.delete_row(key.kind(), key.pk(), guard.as_ref())? == 0 {
                            return Err(self.row_violation(tx, key, expected, policy.as_ref())?);
                        }
                        Ok(())
                    })?;
                }
            }
        }
        Ok(written)
    }

    fn write_update(
        &self,
        key: &EntityKey,
        set_columns: &[(String, Value)],
        expected: Option<LockMarker>,
        policy: Option<&OptimisticLockPolicy>,
    ) -> Result<Option<LockMarker>> {
        let mut assignments: Vec<(String, ColumnUpdate)> = set_columns
            .iter()
            .filter(|(column, _)| policy.is_none_or(|p| p.field() != column.as_str()))
            .map(|(column, value)| (column.clone(), ColumnUpdate::Value(value.clone())))
            .collect();

        let Some(policy) = policy else {
            tracing::trace!(key = %key, "Updating unguarded row");
            return self.with_transaction(|tx| {
                if tx.update_row(key.kind(), key.pk(), &assignments, None)? == 0 {
                    return Err(self.row_violation(tx, key, expected, None)?);
                }
                Ok(None)
            });
        };

        // A newer marker in the shared cache means another unit of work
        // already committed over what this one read.
        if let Some(original) = self.parent.cached_row(key) {
            let difference =
                policy.version_difference(expected.as_ref(), &original, key, &*self.parent)?;
            if difference == CmpOrdering::Less {
                let found = policy.write_lock_value(&original, key, &*self.parent)?;
                return Err(ConcurrencyViolation {
                    entity: key.clone(),
                    expected,
                    found,
                    reason: ViolationReason::StaleVersion,
                }
                .into());
            }
        }

        let next = policy.new_lock_value(expected.as_ref(), self)?;
        if !policy.accepts_successor(expected.as_ref(), &next)? {
            return Err(ConcurrencyViolation {
                entity: key.clone(),
                expected,
                found: Some(next),
                reason: ViolationReason::TimestampTie,
            }
            .into());
        }

        assignments.push((policy.field().to_string(), ColumnUpdate::Value(next.to_value())));
        let guard = ColumnGuard::new(policy.field(), marker_value(expected));
        tracing::trace!(key = %key, expected = ?expected, next = %next, "Updating guarded row");
        self.with_transaction(|tx| {
            if tx.update_row(key.kind(), key.pk(), &assignments, Some(&guard))? == 0 {
                return Err(self.row_violation(tx, key, expected, Some(policy))?);
            }
            Ok(Some(next))
        })
    }

    /// Explain a write that matched no row.
    fn row_violation(
        &self,
        tx: &mut dyn DatastoreTransaction,
        key: &EntityKey,
        expected: Option<LockMarker>,
        policy: Option<&OptimisticLockPolicy>,
    ) -> Result<Error> {
        let current = tx.read_row(key.kind(), key.pk(), LockMode::None)?;
        let found = match (&current, policy) {
            (Some(row), Some(policy)) => policy.marker_from_row(row)?,
            _ => None,
        };
        let reason = if current.is_some() {
            ViolationReason::RowChanged
        } else {
            ViolationReason::RowMissing
        };
        Ok(ConcurrencyViolation {
            entity: key.clone(),
            expected,
            found,
            reason,
        }
        .into())
    }

    /// Publish written working copies to the shared cache and drop deleted
    /// ones from it.
    fn merge_into_parent(
        &self,
        written: &[(EntityKey, Option<LockMarker>)],
        deleted: &[EntityKey],
    ) -> Result<()> {
        for (key, marker) in written {
            let Some(object) = self.objects.read().get_object(key) else {
                continue;
            };
            let policy = self.policy_for(key.kind());
            let in_cache = policy.as_ref().is_some_and(OptimisticLockPolicy::stores_in_cache);
            if let (Some(policy), Some(marker)) = (&policy, marker) {
                if !in_cache {
                    object.set_column(policy.field(), &marker.to_value())?;
                }
            }

            let original = object.build_original()?;
            self.parent
                .merge_original(original, marker.filter(|_| in_cache))?;
            object.sever_holders()?;

            let row = object.row();
            let mut state = self.state.lock();
            state.tracker.snapshot(key.clone(), &row)?;
            state.read_markers.insert(key.clone(), *marker);
        }

        for key in deleted {
            self.parent.invalidate(key);
            self.objects.write().remove(key);
            let mut state = self.state.lock();
            state.tracker.clear(key);
            state.read_markers.remove(key);
        }

        let mut state = self.state.lock();
        state.new_objects.clear();
        state.deleted.clear();
        Ok(())
    }

    /// Discard every working copy and pending change, rolling back an open
    /// storage transaction. The unit of work stays open.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.name))]
    pub fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.rollback_open_transaction();
        self.discard();
        Ok(())
    }

    /// Roll back and end the unit of work.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.name))]
    pub fn release(&self) {
        self.rollback_open_transaction();
        self.discard();
        self.state.lock().status = UnitStatus::Released;
    }

    fn discard(&self) {
        self.objects.write().clear();
        let mut state = self.state.lock();
        state.tracker.clear_all();
        state.read_markers.clear();
        state.new_objects.clear();
        state.deleted.clear();
    }
}

fn marker_value(marker: Option<LockMarker>) -> Value {
    marker.map_or(Value::Null, |m| m.to_value())
}

impl TransactionScope for UnitOfWork {
    fn is_commit_active(&self) -> bool {
        self.commit_manager.is_active()
    }

    fn was_transaction_begun_prematurely(&self) -> bool {
        self.begun_early.load(Ordering::SeqCst)
    }

    fn begin_early_transaction(&self) -> Result<()> {
        UnitOfWork::begin_early_transaction(self)
    }

    fn working_copy(&self, key: &EntityKey) -> Option<ErasedEntity> {
        self.objects.read().get_erased(key)
    }

    fn read_row_in_transaction(
        &self,
        kind: &str,
        pk: &[Value],
        lock: LockMode,
    ) -> Result<Option<Row>> {
        let mut slot = self.transaction.lock();
        match slot.as_mut() {
            Some(tx) => tx.read_row(kind, pk, lock),
            None if lock == LockMode::None => self.parent.datastore().read_row(kind, pk),
            None => Err(Error::invalid_state(format!(
                "locking read of {kind} needs an open transaction in {}",
                self.name
            ))),
        }
    }

    fn read_rows_in_transaction(
        &self,
        kind: &str,
        column: &str,
        value: &Value,
        lock: LockMode,
    ) -> Result<Vec<Row>> {
        let mut slot = self.transaction.lock();
        match slot.as_mut() {
            Some(tx) => tx.read_rows(kind, column, value, lock),
            None if lock == LockMode::None => {
                self.parent.datastore().read_rows(kind, column, value)
            }
            None => Err(Error::invalid_state(format!(
                "locking read of {kind} needs an open transaction in {}",
                self.name
            ))),
        }
    }

    fn load_context(&self) -> LoadContext {
        self.parent.load_context()
    }
}

impl SessionChain for UnitOfWork {
    fn session_name(&self) -> &str {
        &self.name
    }

    fn is_unit_of_work(&self) -> bool {
        true
    }

    fn parent_session(&self) -> Option<&dyn SessionChain> {
        Some(&*self.parent)
    }

    fn datastore(&self) -> &dyn Datastore {
        &**self.parent.datastore()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("objects", &self.objects.read().len())
            .field("commit", &self.commit_manager.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatastore;
    use crate::working_copy::working_copy_reference;

    #[derive(Debug, Clone)]
    struct Team {
        id: i64,
        name: String,
        version: i64,
        heroes: ValueHolder<Vec<Hero>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Hero {
        id: i64,
        name: String,
        team_id: i64,
    }

    fn team_heroes(team: &Team) -> &ValueHolder<Vec<Hero>> {
        &team.heroes
    }

    impl Entity for Team {
        const KIND: &'static str = "teams";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn primary_key_value(&self) -> Vec<Value> {
            vec![Value::BigInt(self.id)]
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", Value::BigInt(self.id)),
                ("name", Value::from(self.name.as_str())),
                ("version", Value::BigInt(self.version)),
            ]
        }

        fn from_row(row: &Row, ctx: &LoadContext) -> Result<Self> {
            let id: i64 = row.get_named("id")?;
            Ok(Self {
                id,
                name: row.get_named("name")?,
                version: row.get_named("version")?,
                heroes: ctx.lazy_many::<Hero>("team_id", id),
            })
        }

        fn set_column(&mut self, column: &str, value: &Value) -> Result<()> {
            if column == "version" {
                self.version = i64::try_from(value.clone())?;
            }
            Ok(())
        }

        fn map_holders<M: HolderMapper>(&self, mapper: &M) -> Result<Self> {
            Ok(Self {
                heroes: mapper.map("heroes", &self.heroes)?,
                ..self.clone()
            })
        }
    }

    impl Entity for Hero {
        const KIND: &'static str = "heroes";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn primary_key_value(&self) -> Vec<Value> {
            vec![Value::BigInt(self.id)]
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", Value::BigInt(self.id)),
                ("name", Value::from(self.name.as_str())),
                ("team_id", Value::BigInt(self.team_id)),
            ]
        }

        fn from_row(row: &Row, _ctx: &LoadContext) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
                team_id: row.get_named("team_id")?,
            })
        }

        fn set_column(&mut self, _column: &str, _value: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<MemoryDatastore>, Arc<SharedSession>) {
        let store = Arc::new(MemoryDatastore::new("memory"));
        store.define_table("teams", &["id"]);
        store.define_table("heroes", &["id"]);
        store
            .seed(
                "teams",
                Row::from_pairs([
                    ("id", Value::BigInt(1)),
                    ("name", Value::from("Avengers")),
                    ("version", Value::BigInt(1)),
                ]),
            )
            .unwrap();
        store
            .seed(
                "heroes",
                Row::from_pairs([
                    ("id", Value::BigInt(10)),
                    ("name", Value::from("Thor")),
                    ("team_id", Value::BigInt(1)),
                ]),
            )
            .unwrap();
        let shared = SharedSession::new(Arc::clone(&store) as Arc<dyn Datastore>);
        shared.register_descriptor(
            EntityDescriptor::new::<Team>()
                .with_lock_policy(OptimisticLockPolicy::counter("version"))
                .with_relationship("heroes", team_heroes),
        );
        shared.register_descriptor(EntityDescriptor::new::<Hero>().depends_on("teams"));
        (store, shared)
    }

    fn team_pk() -> Vec<Value> {
        vec![Value::BigInt(1)]
    }

    #[test]
    fn test_working_copy_is_isolated_from_cache() {
        let (_store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        team.write().name = "Renamed".to_string();

        let original = shared.cached::<Team>(&team_pk()).unwrap();
        assert_eq!(original.read().name, "Avengers");
        assert!(!Arc::ptr_eq(&team, &original));
        assert!(Arc::ptr_eq(
            &team,
            &uow.read::<Team>(&team_pk()).unwrap().unwrap()
        ));
    }

    #[test]
    fn test_relationship_is_decorated() {
        let (_store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        let holder = team.read().heroes.clone();

        let decorator = working_copy_reference(&holder).unwrap();
        assert!(!decorator.is_instantiated());
        let heroes = holder.working_value().unwrap();
        assert_eq!(heroes.read().len(), 1);
        assert_eq!(decorator.backup().unwrap()[0].name, "Thor");
    }

    #[test]
    fn test_commit_update_bumps_version_and_merges() {
        let (store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        team.write().name = "Renamed".to_string();
        assert_eq!(uow.pending_counts().unwrap().dirty, 1);

        let summary = uow.commit().unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(uow.status(), UnitStatus::Committed);

        let row = store.committed_row("teams", &team_pk()).unwrap();
        assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));
        let original = shared.cached::<Team>(&team_pk()).unwrap();
        assert_eq!(original.read().name, "Renamed");
        assert_eq!(original.read().version, 2);
        assert!(uow.read::<Team>(&team_pk()).is_err());
    }

    #[test]
    fn test_insert_and_delete_ordering() {
        let (store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        uow.register_new(Hero {
            id: 11,
            name: "Loki".to_string(),
            team_id: 1,
        })
        .unwrap();
        assert!(uow.delete::<Hero>(&[Value::BigInt(10)]).unwrap());
        assert!(!uow.delete::<Hero>(&[Value::BigInt(99)]).unwrap());
        assert!(uow.read::<Hero>(&[Value::BigInt(10)]).unwrap().is_none());

        let summary = uow.commit().unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.deleted, 1);
        assert!(store.committed_row("heroes", &[Value::BigInt(11)]).is_some());
        assert!(store.committed_row("heroes", &[Value::BigInt(10)]).is_none());
        assert!(shared.cached::<Hero>(&[Value::BigInt(11)]).is_some());
    }

    #[test]
    fn test_rollback_discards_working_copies() {
        let (store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        team.write().name = "Discarded".to_string();
        uow.rollback().unwrap();

        assert!(uow.pending_counts().unwrap().is_empty());
        let fresh = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        assert_eq!(fresh.read().name, "Avengers");
        assert_eq!(uow.commit().unwrap().total(), 0);
        assert_eq!(
            store
                .committed_row("teams", &team_pk())
                .unwrap()
                .get_by_name("version"),
            Some(&Value::BigInt(1))
        );
    }

    #[test]
    fn test_edited_relationship_blocks_commit() {
        let (store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        let heroes = team.read().heroes.clone();
        heroes.working_value().unwrap().write()[0].name = "Loki".to_string();
        assert!(working_copy_reference(&heroes).unwrap().has_changed());

        let err = uow.commit().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(uow.pending_counts().is_err());
        assert_eq!(uow.status(), UnitStatus::Open);
        assert_eq!(
            store
                .committed_row("heroes", &[Value::BigInt(10)])
                .unwrap()
                .get_by_name("name"),
            Some(&Value::from("Thor"))
        );

        uow.rollback().unwrap();
        assert_eq!(uow.commit().unwrap().total(), 0);
    }

    #[test]
    fn test_commit_writes_through_early_transaction() {
        let (store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        uow.begin_early_transaction().unwrap();
        let team = uow.read::<Team>(&team_pk()).unwrap().unwrap();
        team.write().name = "Early".to_string();

        uow.commit_and_resume().unwrap();
        assert!(!uow.has_open_transaction());
        assert!(!uow.was_transaction_begun_prematurely());
        assert_eq!(
            store
                .committed_row("teams", &team_pk())
                .unwrap()
                .get_by_name("name"),
            Some(&Value::from("Early"))
        );
    }

    #[test]
    fn test_locking_read_without_transaction_is_invalid() {
        let (_store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        let err = uow
            .read_row_in_transaction("teams", &team_pk(), LockMode::PessimisticWrite)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        uow.begin_early_transaction().unwrap();
        assert!(uow.was_transaction_begun_prematurely());
        assert!(
            uow.read_row_in_transaction("teams", &team_pk(), LockMode::PessimisticWrite)
                .unwrap()
                .is_some()
        );
        uow.release();
        assert_eq!(uow.status(), UnitStatus::Released);
        assert!(!uow.has_open_transaction());
    }

    #[test]
    fn test_session_chain_walks_to_shared_session() {
        let (_store, shared) = setup();
        let uow = shared.acquire_unit_of_work();
        assert!(uow.is_unit_of_work());
        assert_eq!(uow.session_name(), "default-uow-1");
        let outermost = keel_core::outermost_session(&*uow);
        assert_eq!(outermost.session_name(), "default");
    }
}
