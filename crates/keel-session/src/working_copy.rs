//! Working-copy decorators for shared lazy references.
//!
//! When a unit of work clones an original out of the shared cache, each
//! relationship reference of the clone is wrapped in a
//! [`WorkingCopyLazyReference`]. Triggering the decorator produces a private
//! clone of the shared value plus a backup clone used for change detection,
//! so edits made inside one transaction never leak into the cache or into
//! other transactions.
//!
//! A decorator normally keeps a weak link to the shared reference it
//! wraps. The link is severed when the working copy is merged back or when
//! the decorator is rebuilt from its transport form; a severed decorator
//! resolves its value through the owning entity's original instead.

use crate::descriptor::OriginalResolver;
use crate::unit_of_work::UnitOfWork;
use keel_core::{
    EntityKey, Error, LazyReference, Managed, ResolutionError, Result, TransactionScope,
    ValueHolder, ValueHolderInterface,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_ORIGIN_ID: AtomicU64 = AtomicU64::new(1);

/// How a decorator clones the shared value.
pub trait CloneStrategy<T>: Send + Sync {
    /// The private working value handed to the transaction.
    fn build_clone_for(&self, value: &T) -> T;

    /// The snapshot kept for change detection.
    fn build_backup_clone_for(&self, value: &T) -> T;
}

/// Clone through [`Clone`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainClone;

impl<T: Clone> CloneStrategy<T> for PlainClone {
    fn build_clone_for(&self, value: &T) -> T {
        value.clone()
    }

    fn build_backup_clone_for(&self, value: &T) -> T {
        value.clone()
    }
}

/// Why a decorator no longer links to a shared reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverReason {
    /// The working copy was merged into the shared cache.
    Merged,
    /// Rebuilt from a [`TransportedReference`].
    Transported { remote_origin_id: u64 },
}

enum WrappedLink<T> {
    Live(Weak<LazyReference<T>>),
    Severed(SeverReason),
}

/// Serializable form of a decorator, sent across a process boundary.
///
/// It names the owning entity and the attribute; the receiving side
/// resolves the value through its own shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportedReference {
    pub source: EntityKey,
    pub attribute: String,
    pub remote_origin_id: u64,
}

/// A transaction-private decorator around a shared [`LazyReference`].
pub struct WorkingCopyLazyReference<T> {
    wrapped: RwLock<WrappedLink<T>>,
    value: RwLock<Option<Managed<T>>>,
    /// Makes the trigger run at most once per decorator.
    trigger_lock: Mutex<()>,
    backup: RwLock<Option<T>>,
    owner: Weak<UnitOfWork>,
    source: EntityKey,
    attribute: String,
    clone_strategy: Arc<dyn CloneStrategy<T>>,
    origin_id: u64,
}

impl<T: Clone + Send + Sync + 'static> WorkingCopyLazyReference<T> {
    pub fn new(
        wrapped: &Arc<LazyReference<T>>,
        owner: Weak<UnitOfWork>,
        source: EntityKey,
        attribute: impl Into<String>,
        clone_strategy: Arc<dyn CloneStrategy<T>>,
    ) -> Self {
        Self::with_link(
            WrappedLink::Live(Arc::downgrade(wrapped)),
            owner,
            source,
            attribute.into(),
            clone_strategy,
            NEXT_ORIGIN_ID.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn with_link(
        link: WrappedLink<T>,
        owner: Weak<UnitOfWork>,
        source: EntityKey,
        attribute: String,
        clone_strategy: Arc<dyn CloneStrategy<T>>,
        origin_id: u64,
    ) -> Self {
        Self {
            wrapped: RwLock::new(link),
            value: RwLock::new(None),
            trigger_lock: Mutex::new(()),
            backup: RwLock::new(None),
            owner,
            source,
            attribute,
            clone_strategy,
            origin_id,
        }
    }

    /// Rebuild a decorator from its transport form, owned by `owner`.
    ///
    /// The result is severed until [`reattach`](Self::reattach) or
    /// [`reattach_to_original`](Self::reattach_to_original) is called.
    pub fn from_transport(transported: TransportedReference, owner: &Arc<UnitOfWork>) -> Self {
        let clone_strategy = owner
            .shared_session()
            .descriptor(transported.source.kind())
            .map_or_else(
                || Arc::new(PlainClone) as Arc<dyn CloneStrategy<T>>,
                |d| d.clone_strategy_for::<T>(&transported.attribute),
            );
        Self::with_link(
            WrappedLink::Severed(SeverReason::Transported {
                remote_origin_id: transported.remote_origin_id,
            }),
            Arc::downgrade(owner),
            transported.source,
            transported.attribute,
            clone_strategy,
            transported.remote_origin_id,
        )
    }

    pub fn to_transport(&self) -> TransportedReference {
        TransportedReference {
            source: self.source.clone(),
            attribute: self.attribute.clone(),
            remote_origin_id: self.origin_id,
        }
    }

    pub fn source(&self) -> &EntityKey {
        &self.source
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Trigger the decorator: return the private working value, computing
    /// it on first call.
    #[tracing::instrument(level = "debug", skip(self), fields(source = %self.source, attribute = %self.attribute))]
    pub fn trigger(&self) -> Result<Managed<T>> {
        if let Some(v) = self.value.read().as_ref() {
            return Ok(Arc::clone(v));
        }

        let _trigger = self.trigger_lock.lock();
        if let Some(v) = self.value.read().as_ref() {
            return Ok(Arc::clone(v));
        }

        let owner = self.owner.upgrade().ok_or_else(|| {
            Error::invalid_state(format!(
                "working copy reference {}.{} has no owning unit of work",
                self.source, self.attribute
            ))
        })?;

        let value = match self.live_wrapped() {
            Some(wrapped) => self.trigger_wrapped(&wrapped, &*owner)?,
            None => self.resolve_from_original(&**owner.shared_session())?,
        };

        *self.backup.write() = Some(self.clone_strategy.build_backup_clone_for(&value));
        let managed = Arc::new(RwLock::new(value));
        *self.value.write() = Some(Arc::clone(&managed));
        Ok(managed)
    }

    fn live_wrapped(&self) -> Option<Arc<LazyReference<T>>> {
        match &*self.wrapped.read() {
            WrappedLink::Live(weak) => weak.upgrade(),
            WrappedLink::Severed(_) => None,
        }
    }

    /// Trigger through the shared reference, holding its trigger lock so
    /// decorators of the same reference never interleave.
    fn trigger_wrapped(&self, wrapped: &LazyReference<T>, scope: &dyn TransactionScope) -> Result<T> {
        let _exclusive = wrapped.lock_for_trigger();

        if wrapped.is_deferred() && !wrapped.is_easily_instantiated() {
            if wrapped.is_pessimistic_locking() {
                // No-op when the transaction is already open, including
                // the one a running commit writes through.
                scope.begin_early_transaction()?;
                tracing::trace!(
                    target: "keel::transaction",
                    source = %self.source,
                    attribute = %self.attribute,
                    "instantiate_pl_relationship"
                );
            }
            if scope.is_commit_active() || scope.was_transaction_begun_prematurely() {
                return wrapped.instantiate_for_unit_of_work(scope);
            }
        }

        if !wrapped.is_instantiated() {
            if let Some(found) = wrapped.value_in_transaction(scope)? {
                return Ok(found);
            }
        }

        let shared = wrapped.get()?;
        Ok(self.clone_strategy.build_clone_for(&shared))
    }

    /// Resolve the value through the owning entity's original.
    fn resolve_from_original(&self, resolver: &dyn OriginalResolver) -> Result<T> {
        let failure = |message: String| {
            Error::Resolution(ResolutionError {
                entity: self.source.clone(),
                attribute: self.attribute.clone(),
                message,
            })
        };

        let original = resolver
            .resolve_original(&self.source)?
            .ok_or_else(|| failure("original not found".to_string()))?;
        let descriptor = resolver
            .descriptor(self.source.kind())
            .ok_or_else(|| failure(format!("no descriptor for '{}'", self.source.kind())))?;
        let mapping = descriptor
            .mapping_for_attribute(&self.attribute)
            .ok_or_else(|| failure("attribute is not mapped".to_string()))?;
        let real = mapping
            .read_real_attribute_value(&original)?
            .downcast::<T>()
            .map_err(|_| failure("mapped attribute has a different type".to_string()))?;

        tracing::debug!(source = %self.source, attribute = %self.attribute, "Resolved severed reference through original");
        Ok(self.clone_strategy.build_clone_for(&real))
    }

    pub fn is_instantiated(&self) -> bool {
        self.value.read().is_some()
    }

    pub fn is_easily_instantiated(&self) -> bool {
        if self.is_instantiated() {
            return true;
        }
        match self.live_wrapped() {
            Some(wrapped) => !wrapped.is_deferred() || wrapped.is_easily_instantiated(),
            None => true,
        }
    }

    pub fn is_pessimistic_locking(&self) -> bool {
        self.live_wrapped()
            .is_some_and(|wrapped| wrapped.is_pessimistic_locking())
    }

    /// Was this decorator rebuilt from a transport form and never
    /// reattached?
    pub fn is_severed_remote_reference(&self) -> bool {
        matches!(
            &*self.wrapped.read(),
            WrappedLink::Severed(SeverReason::Transported { .. })
        )
    }

    pub fn sever_reason(&self) -> Option<SeverReason> {
        match &*self.wrapped.read() {
            WrappedLink::Live(_) => None,
            WrappedLink::Severed(reason) => Some(*reason),
        }
    }

    /// Release the decorator from its transaction. Units of work keep
    /// nothing per decorator, so there is nothing to release.
    pub fn release_from_transaction(&self) {}

    /// Link the decorator to `wrapped`.
    pub fn reattach(&self, wrapped: &Arc<LazyReference<T>>) {
        *self.wrapped.write() = WrappedLink::Live(Arc::downgrade(wrapped));
    }

    /// Link the decorator to the shared reference held by its owning
    /// entity's original.
    pub fn reattach_to_original(&self) -> Result<()> {
        let shared = self.original_shared_reference()?;
        self.reattach(&shared);
        Ok(())
    }

    /// The shared reference the owning entity's original holds for this
    /// attribute.
    fn original_shared_reference(&self) -> Result<Arc<LazyReference<T>>> {
        let owner = self.owner.upgrade().ok_or_else(|| {
            Error::invalid_state(format!(
                "working copy reference {}.{} has no owning unit of work",
                self.source, self.attribute
            ))
        })?;
        let session = owner.shared_session();
        let failure = |message: &str| {
            Error::Resolution(ResolutionError {
                entity: self.source.clone(),
                attribute: self.attribute.clone(),
                message: message.to_string(),
            })
        };
        let original = session
            .resolve_original(&self.source)?
            .ok_or_else(|| failure("original not found"))?;
        let descriptor = session
            .descriptor(self.source.kind())
            .ok_or_else(|| failure("kind has no descriptor"))?;
        descriptor
            .shared_reference_of::<T>(&original, &self.attribute)?
            .ok_or_else(|| failure("original holds no shared reference"))
    }

    /// The backup clone taken at trigger time.
    pub fn backup(&self) -> Option<T> {
        self.backup.read().clone()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> WorkingCopyLazyReference<T> {
    /// Does the working value differ from its backup? Untriggered
    /// decorators never changed. A unit of work refuses to commit while
    /// any of its decorators has changed.
    pub fn has_changed(&self) -> bool {
        let Some(value) = self.value.read().as_ref().map(Arc::clone) else {
            return false;
        };
        let current = value.read().clone();
        self.backup.read().as_ref() != Some(&current)
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ValueHolderInterface<T>
    for WorkingCopyLazyReference<T>
{
    fn value(&self) -> Result<Managed<T>> {
        self.trigger()
    }

    fn is_instantiated(&self) -> bool {
        WorkingCopyLazyReference::is_instantiated(self)
    }

    fn is_easily_instantiated(&self) -> bool {
        WorkingCopyLazyReference::is_easily_instantiated(self)
    }

    fn is_pessimistic_locking(&self) -> bool {
        WorkingCopyLazyReference::is_pessimistic_locking(self)
    }

    fn has_changed(&self) -> bool {
        WorkingCopyLazyReference::has_changed(self)
    }

    /// The original keeps what storage holds: the live shared reference,
    /// else the reference its cached original already holds, else the
    /// backup taken at trigger time. The working value is never published.
    fn release_for_merge(&self) -> Result<Arc<LazyReference<T>>> {
        if let Some(wrapped) = self.live_wrapped() {
            return Ok(wrapped);
        }
        match (self.original_shared_reference(), self.backup()) {
            (Ok(shared), _) => Ok(shared),
            (Err(_), Some(backup)) => Ok(Arc::new(LazyReference::resolved(backup))),
            (Err(e), None) => Err(e),
        }
    }

    fn sever(&self) {
        let mut wrapped = self.wrapped.write();
        if matches!(*wrapped, WrappedLink::Live(_)) {
            *wrapped = WrappedLink::Severed(SeverReason::Merged);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T> fmt::Debug for WorkingCopyLazyReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = match &*self.wrapped.read() {
            WrappedLink::Live(weak) if weak.strong_count() > 0 => "live".to_string(),
            WrappedLink::Live(_) => "dropped".to_string(),
            WrappedLink::Severed(reason) => format!("severed ({reason:?})"),
        };
        f.debug_struct("WorkingCopyLazyReference")
            .field("source", &self.source)
            .field("attribute", &self.attribute)
            .field("instantiated", &self.value.read().is_some())
            .field("link", &link)
            .finish_non_exhaustive()
    }
}

/// The working-copy decorator behind `holder`, if it holds one.
pub fn working_copy_reference<T: Clone + Send + Sync + 'static>(
    holder: &ValueHolder<T>,
) -> Option<&WorkingCopyLazyReference<T>> {
    holder
        .decorator()
        .and_then(|d| d.as_any().downcast_ref::<WorkingCopyLazyReference<T>>())
}
