//! Entity descriptors: what the session knows about each entity kind.
//!
//! A descriptor carries the kind's optimistic-lock policy, the commit-order
//! dependencies and one [`AttributeMapping`] per relationship attribute.
//! Mappings are how a severed working-copy reference finds its value again:
//! it resolves the owning original and reads the attribute through the
//! mapping.

use crate::shared::SharedSession;
use crate::working_copy::{CloneStrategy, PlainClone};
use keel_core::{
    Entity, EntityKey, Error, ErasedEntity, LazyReference, Result, ValueHolder, downcast_entity,
};
use keel_locking::OptimisticLockPolicy;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased access to one relationship attribute of an entity kind.
pub trait AttributeMapping: Send + Sync {
    fn attribute(&self) -> &'static str;

    /// Read the attribute's value from `object`, triggering its reference if
    /// needed. The box holds a `T`.
    fn read_real_attribute_value(&self, object: &ErasedEntity) -> Result<Box<dyn Any + Send>>;

    /// The shared reference `object` holds for this attribute, boxed as an
    /// `Arc<LazyReference<T>>`. `None` if `object` holds a decorator.
    fn shared_reference(&self, object: &ErasedEntity) -> Result<Option<Box<dyn Any + Send>>>;

    /// The clone strategy for this attribute, boxed as an
    /// `Arc<dyn CloneStrategy<T>>`.
    fn clone_strategy(&self) -> Box<dyn Any + Send>;
}

/// Mapping of a [`ValueHolder`] field of `E`.
pub struct RelationshipMapping<E, T> {
    attribute: &'static str,
    accessor: fn(&E) -> &ValueHolder<T>,
    clone_strategy: Arc<dyn CloneStrategy<T>>,
}

impl<E: Entity, T: Clone + Send + Sync + 'static> RelationshipMapping<E, T> {
    pub fn new(attribute: &'static str, accessor: fn(&E) -> &ValueHolder<T>) -> Self {
        Self {
            attribute,
            accessor,
            clone_strategy: Arc::new(PlainClone),
        }
    }

    #[must_use]
    pub fn with_clone_strategy(mut self, strategy: Arc<dyn CloneStrategy<T>>) -> Self {
        self.clone_strategy = strategy;
        self
    }

    fn holder_of(&self, object: &ErasedEntity) -> Result<ValueHolder<T>> {
        let managed = downcast_entity::<E>(Arc::clone(object)).ok_or_else(|| {
            Error::invalid_state(format!(
                "mapping '{}' expects an entity of kind '{}'",
                self.attribute,
                E::KIND
            ))
        })?;
        // Clone the holder so the entity lock is released before triggering.
        let guard = managed.read();
        let holder = (self.accessor)(&guard).clone();
        drop(guard);
        Ok(holder)
    }
}

impl<E: Entity, T: Clone + Send + Sync + 'static> AttributeMapping for RelationshipMapping<E, T> {
    fn attribute(&self) -> &'static str {
        self.attribute
    }

    #[tracing::instrument(level = "debug", skip(self, object), fields(kind = E::KIND, attribute = self.attribute))]
    fn read_real_attribute_value(&self, object: &ErasedEntity) -> Result<Box<dyn Any + Send>> {
        let value: T = self.holder_of(object)?.get()?;
        Ok(Box::new(value))
    }

    fn shared_reference(&self, object: &ErasedEntity) -> Result<Option<Box<dyn Any + Send>>> {
        let holder = self.holder_of(object)?;
        Ok(holder
            .shared_reference()
            .map(|lazy| Box::new(Arc::clone(lazy)) as Box<dyn Any + Send>))
    }

    fn clone_strategy(&self) -> Box<dyn Any + Send> {
        Box::new(Arc::clone(&self.clone_strategy))
    }
}

type Loader = fn(&SharedSession, &EntityKey) -> Result<Option<ErasedEntity>>;

fn load_erased<E: Entity>(session: &SharedSession, key: &EntityKey) -> Result<Option<ErasedEntity>> {
    Ok(session.read::<E>(key.pk())?.map(|managed| {
        let erased: ErasedEntity = managed;
        erased
    }))
}

/// Everything the session knows about one entity kind.
pub struct EntityDescriptor {
    kind: &'static str,
    primary_key: &'static [&'static str],
    type_id: TypeId,
    lock_policy: Option<OptimisticLockPolicy>,
    mappings: Vec<Arc<dyn AttributeMapping>>,
    depends_on: Vec<&'static str>,
    loader: Loader,
}

impl EntityDescriptor {
    pub fn new<E: Entity>() -> Self {
        Self {
            kind: E::KIND,
            primary_key: E::PRIMARY_KEY,
            type_id: TypeId::of::<E>(),
            lock_policy: None,
            mappings: Vec::new(),
            depends_on: Vec::new(),
            loader: load_erased::<E>,
        }
    }

    /// Guard this kind with `policy`.
    #[must_use]
    pub fn with_lock_policy(mut self, policy: OptimisticLockPolicy) -> Self {
        self.lock_policy = Some(policy);
        self
    }

    /// Map the relationship attribute `attribute`, cloned with `Clone`.
    #[must_use]
    pub fn with_relationship<E: Entity, T: Clone + Send + Sync + 'static>(
        self,
        attribute: &'static str,
        accessor: fn(&E) -> &ValueHolder<T>,
    ) -> Self {
        self.with_mapping(RelationshipMapping::new(attribute, accessor))
    }

    #[must_use]
    pub fn with_mapping(mut self, mapping: impl AttributeMapping + 'static) -> Self {
        self.mappings.push(Arc::new(mapping));
        self
    }

    /// Declare that rows of this kind reference rows of `kind`: they are
    /// inserted after and deleted before those rows.
    #[must_use]
    pub fn depends_on(mut self, kind: &'static str) -> Self {
        self.depends_on.push(kind);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn primary_key(&self) -> &'static [&'static str] {
        self.primary_key
    }

    pub fn describes<E: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    pub fn lock_policy(&self) -> Option<&OptimisticLockPolicy> {
        self.lock_policy.as_ref()
    }

    pub fn dependencies(&self) -> &[&'static str] {
        &self.depends_on
    }

    pub fn mapping_for_attribute(&self, attribute: &str) -> Option<&Arc<dyn AttributeMapping>> {
        self.mappings.iter().find(|m| m.attribute() == attribute)
    }

    /// Read the entity `key` through `session`'s cache.
    pub(crate) fn load(&self, session: &SharedSession, key: &EntityKey) -> Result<Option<ErasedEntity>> {
        (self.loader)(session, key)
    }

    /// The clone strategy registered for `attribute`, or [`PlainClone`].
    pub fn clone_strategy_for<T: Clone + Send + Sync + 'static>(
        &self,
        attribute: &str,
    ) -> Arc<dyn CloneStrategy<T>> {
        self.mapping_for_attribute(attribute)
            .and_then(|m| m.clone_strategy().downcast::<Arc<dyn CloneStrategy<T>>>().ok())
            .map_or_else(|| Arc::new(PlainClone) as Arc<dyn CloneStrategy<T>>, |s| *s)
    }

    /// The shared reference `object` holds for `attribute`.
    pub fn shared_reference_of<T: Send + Sync + 'static>(
        &self,
        object: &ErasedEntity,
        attribute: &str,
    ) -> Result<Option<Arc<LazyReference<T>>>> {
        let Some(mapping) = self.mapping_for_attribute(attribute) else {
            return Ok(None);
        };
        Ok(mapping
            .shared_reference(object)?
            .and_then(|boxed| boxed.downcast::<Arc<LazyReference<T>>>().ok())
            .map(|lazy| *lazy))
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes: Vec<&str> = self.mappings.iter().map(|m| m.attribute()).collect();
        f.debug_struct("EntityDescriptor")
            .field("kind", &self.kind)
            .field("primary_key", &self.primary_key)
            .field("lock_policy", &self.lock_policy)
            .field("attributes", &attributes)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Finds originals in the shared cache (reading them if needed) and the
/// descriptors of their kinds.
pub trait OriginalResolver: Send + Sync {
    fn resolve_original(&self, key: &EntityKey) -> Result<Option<ErasedEntity>>;

    fn descriptor(&self, kind: &str) -> Option<Arc<EntityDescriptor>>;
}
