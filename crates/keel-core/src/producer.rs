//! Producers behind deferred lazy references.

use crate::Result;
use crate::datastore::{Datastore, LockMode};
use crate::entity::{Entity, EntityKey, downcast_entity};
use crate::lazy::ValueHolder;
use crate::scope::TransactionScope;
use crate::value::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Computes the value of a deferred [`LazyReference`](crate::LazyReference).
pub trait ValueProducer<T>: Send + Sync {
    /// Compute the value outside any transaction.
    fn produce(&self) -> Result<T>;

    /// Compute the value through the reads of `scope`'s transaction.
    fn produce_for_transaction(&self, scope: &dyn TransactionScope) -> Result<T>;

    /// Find the value among `scope`'s working copies without reading
    /// storage. `None` means the working set cannot answer.
    fn lookup_in_transaction(&self, scope: &dyn TransactionScope) -> Result<Option<T>> {
        let _ = scope;
        Ok(None)
    }

    /// Does producing take pessimistic row locks?
    fn is_pessimistic_locking(&self) -> bool {
        false
    }

    /// Is producing guaranteed not to touch storage?
    fn is_easily_instantiated(&self) -> bool {
        false
    }
}

/// What an entity needs while being built from a row: a way to give its
/// relationship attributes deferred producers.
#[derive(Clone)]
pub struct LoadContext {
    datastore: Arc<dyn Datastore>,
}

impl LoadContext {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    /// A to-one reference following the foreign key `fk` (NULL for none).
    pub fn lazy_one<E: Entity>(&self, fk: impl Into<Value>) -> ValueHolder<Option<E>> {
        ValueHolder::deferred(ToOneProducer::<E>::new(
            Arc::clone(&self.datastore),
            fk.into(),
            LockMode::None,
        ))
    }

    /// A to-one reference whose target row is locked when read inside a
    /// transaction.
    pub fn lazy_one_locking<E: Entity>(&self, fk: impl Into<Value>) -> ValueHolder<Option<E>> {
        ValueHolder::deferred(ToOneProducer::<E>::new(
            Arc::clone(&self.datastore),
            fk.into(),
            LockMode::PessimisticWrite,
        ))
    }

    /// A to-many reference: every `E` whose `column` holds `parent_pk`.
    pub fn lazy_many<E: Entity>(
        &self,
        column: &'static str,
        parent_pk: impl Into<Value>,
    ) -> ValueHolder<Vec<E>> {
        ValueHolder::deferred(ToManyProducer::<E>::new(
            Arc::clone(&self.datastore),
            column,
            parent_pk.into(),
            LockMode::None,
        ))
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("datastore", &self.datastore.name())
            .finish()
    }
}

/// Loads the single target of a foreign key.
pub struct ToOneProducer<E> {
    datastore: Arc<dyn Datastore>,
    /// Primary key of the target; `None` for a NULL foreign key.
    target: Option<Vec<Value>>,
    lock: LockMode,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> ToOneProducer<E> {
    pub fn new(datastore: Arc<dyn Datastore>, fk: Value, lock: LockMode) -> Self {
        let target = if fk.is_null() { None } else { Some(vec![fk]) };
        Self {
            datastore,
            target,
            lock,
            _entity: PhantomData,
        }
    }

    fn target_key(&self) -> Option<EntityKey> {
        self.target
            .as_ref()
            .map(|pk| EntityKey::new(E::KIND, pk.clone()))
    }
}

impl<E: Entity> ValueProducer<Option<E>> for ToOneProducer<E> {
    #[tracing::instrument(level = "debug", skip(self), fields(kind = E::KIND))]
    fn produce(&self) -> Result<Option<E>> {
        let Some(pk) = &self.target else {
            return Ok(None);
        };
        let ctx = LoadContext::new(Arc::clone(&self.datastore));
        self.datastore
            .read_row(E::KIND, pk)?
            .map(|row| E::from_row(&row, &ctx))
            .transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, scope), fields(kind = E::KIND, lock = ?self.lock))]
    fn produce_for_transaction(&self, scope: &dyn TransactionScope) -> Result<Option<E>> {
        let Some(pk) = &self.target else {
            return Ok(None);
        };
        let ctx = scope.load_context();
        scope
            .read_row_in_transaction(E::KIND, pk, self.lock)?
            .map(|row| E::from_row(&row, &ctx))
            .transpose()
    }

    fn lookup_in_transaction(&self, scope: &dyn TransactionScope) -> Result<Option<Option<E>>> {
        let Some(key) = self.target_key() else {
            return Ok(None);
        };
        let found = scope
            .working_copy(&key)
            .and_then(downcast_entity::<E>)
            .map(|managed| Some(managed.read().clone()));
        if found.is_some() {
            tracing::trace!(key = %key, "Relationship target found among working copies");
        }
        Ok(found)
    }

    fn is_pessimistic_locking(&self) -> bool {
        self.lock == LockMode::PessimisticWrite
    }

    fn is_easily_instantiated(&self) -> bool {
        self.target.is_none()
    }
}

/// Loads every row of `E` pointing back at one parent.
pub struct ToManyProducer<E> {
    datastore: Arc<dyn Datastore>,
    column: &'static str,
    parent_pk: Value,
    lock: LockMode,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> ToManyProducer<E> {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        column: &'static str,
        parent_pk: Value,
        lock: LockMode,
    ) -> Self {
        Self {
            datastore,
            column,
            parent_pk,
            lock,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> ValueProducer<Vec<E>> for ToManyProducer<E> {
    #[tracing::instrument(level = "debug", skip(self), fields(kind = E::KIND, column = self.column))]
    fn produce(&self) -> Result<Vec<E>> {
        let ctx = LoadContext::new(Arc::clone(&self.datastore));
        self.datastore
            .read_rows(E::KIND, self.column, &self.parent_pk)?
            .iter()
            .map(|row| E::from_row(row, &ctx))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, scope), fields(kind = E::KIND, column = self.column))]
    fn produce_for_transaction(&self, scope: &dyn TransactionScope) -> Result<Vec<E>> {
        let ctx = scope.load_context();
        scope
            .read_rows_in_transaction(E::KIND, self.column, &self.parent_pk, self.lock)?
            .iter()
            .map(|row| E::from_row(row, &ctx))
            .collect()
    }

    fn is_pessimistic_locking(&self) -> bool {
        self.lock == LockMode::PessimisticWrite
    }
}

/// A producer backed by a closure. The closure runs for both the plain and
/// the transactional path.
pub struct ClosureProducer<F> {
    f: F,
    pessimistic: bool,
}

impl<F> ClosureProducer<F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            pessimistic: false,
        }
    }

    /// Mark the producer as taking pessimistic locks.
    #[must_use]
    pub fn pessimistic(mut self) -> Self {
        self.pessimistic = true;
        self
    }
}

impl<T, F> ValueProducer<T> for ClosureProducer<F>
where
    F: Fn() -> Result<T> + Send + Sync,
{
    fn produce(&self) -> Result<T> {
        (self.f)()
    }

    fn produce_for_transaction(&self, _scope: &dyn TransactionScope) -> Result<T> {
        (self.f)()
    }

    fn is_pessimistic_locking(&self) -> bool {
        self.pessimistic
    }
}
