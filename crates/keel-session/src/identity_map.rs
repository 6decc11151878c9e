//! Identity map: one instance per entity key.
//!
//! Both the shared cache and each unit of work keep one. Looking the same
//! key up twice yields the same `Arc`, so a change made through one handle
//! is visible through every other.
//!
//! Entries are stored type-erased behind [`ManagedObject`], which also
//! carries the per-entity operations the session needs at merge time
//! without knowing the concrete type.

use keel_core::{
    Entity, EntityKey, ErasedEntity, HolderMapper, Managed, Result, Row, Value, ValueHolder,
    downcast_entity,
};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A managed entity with its concrete type erased.
pub(crate) trait ManagedObject: Send + Sync {
    fn key(&self) -> EntityKey;

    /// The entity's columns as a row.
    fn row(&self) -> Row;

    fn erased(&self) -> ErasedEntity;

    fn set_column(&self, column: &str, value: &Value) -> Result<()>;

    /// Build the original the shared cache should hold for this working
    /// copy: same columns, every decorator released to a shared reference.
    fn build_original(&self) -> Result<Arc<dyn ManagedObject>>;

    /// Replace this entity's state with `other`'s, keeping the instance.
    fn overwrite_with(&self, other: &dyn ManagedObject) -> Result<()>;

    /// Cut every decorator of this working copy off its shared reference.
    fn sever_holders(&self) -> Result<()>;

    /// Relationship attributes whose working value was edited since it was
    /// triggered.
    fn edited_relationships(&self) -> Result<Vec<&'static str>>;

    fn as_any(&self) -> &dyn Any;
}

struct TrackedEntity<E> {
    cell: Managed<E>,
}

/// Turns decorators back into shared references.
struct ReleaseForMerge;

impl HolderMapper for ReleaseForMerge {
    fn map<T: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        _attribute: &'static str,
        holder: &ValueHolder<T>,
    ) -> Result<ValueHolder<T>> {
        match holder {
            ValueHolder::Shared(lazy) => Ok(ValueHolder::Shared(Arc::clone(lazy))),
            ValueHolder::Decorated(decorator) => {
                Ok(ValueHolder::Shared(decorator.release_for_merge()?))
            }
        }
    }
}

struct SeverHolders;

impl HolderMapper for SeverHolders {
    fn map<T: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        _attribute: &'static str,
        holder: &ValueHolder<T>,
    ) -> Result<ValueHolder<T>> {
        if let Some(decorator) = holder.decorator() {
            decorator.sever();
        }
        Ok(holder.clone())
    }
}

#[derive(Default)]
struct CollectEdited {
    edited: Mutex<Vec<&'static str>>,
}

impl HolderMapper for CollectEdited {
    fn map<T: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        attribute: &'static str,
        holder: &ValueHolder<T>,
    ) -> Result<ValueHolder<T>> {
        if holder.decorator().is_some_and(|d| d.has_changed()) {
            self.edited.lock().push(attribute);
        }
        Ok(holder.clone())
    }
}

impl<E: Entity> ManagedObject for TrackedEntity<E> {
    fn key(&self) -> EntityKey {
        self.cell.read().key()
    }

    fn row(&self) -> Row {
        Row::from_pairs(self.cell.read().to_row())
    }

    fn erased(&self) -> ErasedEntity {
        Arc::clone(&self.cell) as ErasedEntity
    }

    fn set_column(&self, column: &str, value: &Value) -> Result<()> {
        self.cell.write().set_column(column, value)
    }

    fn build_original(&self) -> Result<Arc<dyn ManagedObject>> {
        // Snapshot first: releasing a decorator may trigger it, and the
        // trigger may need to read this entity.
        let snapshot = self.cell.read().clone();
        let original = snapshot.map_holders(&ReleaseForMerge)?;
        Ok(Arc::new(TrackedEntity {
            cell: Arc::new(RwLock::new(original)),
        }))
    }

    fn overwrite_with(&self, other: &dyn ManagedObject) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<TrackedEntity<E>>()
            .ok_or_else(|| {
                keel_core::Error::invalid_state(format!(
                    "cannot merge a different entity type into {}",
                    E::KIND
                ))
            })?;
        if Arc::ptr_eq(&self.cell, &other.cell) {
            return Ok(());
        }
        let state = other.cell.read().clone();
        *self.cell.write() = state;
        Ok(())
    }

    fn sever_holders(&self) -> Result<()> {
        let snapshot = self.cell.read().clone();
        snapshot.map_holders(&SeverHolders).map(|_| ())
    }

    fn edited_relationships(&self) -> Result<Vec<&'static str>> {
        let snapshot = self.cell.read().clone();
        let collect = CollectEdited::default();
        snapshot.map_holders(&collect)?;
        Ok(collect.edited.into_inner())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Identity map keyed by [`EntityKey`].
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, Arc<dyn ManagedObject>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entity`, replacing any instance under the same key.
    pub fn insert<E: Entity>(&mut self, entity: E) -> Managed<E> {
        let managed = Arc::new(RwLock::new(entity));
        self.insert_managed(Arc::clone(&managed));
        managed
    }

    pub fn insert_managed<E: Entity>(&mut self, managed: Managed<E>) {
        let key = managed.read().key();
        tracing::trace!(key = %key, "Inserting into identity map");
        self.entries
            .insert(key, Arc::new(TrackedEntity { cell: managed }));
    }

    /// Return the instance under `entity`'s key, inserting `entity` if
    /// there is none.
    pub fn get_or_insert<E: Entity>(&mut self, entity: E) -> Managed<E> {
        match self.get::<E>(&entity.primary_key_value()) {
            Some(existing) => existing,
            None => self.insert(entity),
        }
    }

    pub fn get<E: Entity>(&self, pk: &[Value]) -> Option<Managed<E>> {
        self.get_erased(&EntityKey::new(E::KIND, pk.to_vec()))
            .and_then(downcast_entity::<E>)
    }

    pub fn get_erased(&self, key: &EntityKey) -> Option<ErasedEntity> {
        self.entries.get(key).map(|entry| entry.erased())
    }

    pub(crate) fn get_object(&self, key: &EntityKey) -> Option<Arc<dyn ManagedObject>> {
        self.entries.get(key).map(Arc::clone)
    }

    pub(crate) fn put_object(&mut self, object: Arc<dyn ManagedObject>) {
        self.entries.insert(object.key(), object);
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &Arc<dyn ManagedObject>> {
        self.entries.values()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry of `kind`; returns how many were removed.
    pub fn remove_kind(&mut self, kind: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.kind() != kind);
        before - self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.entries.len())
            .finish()
    }
}
