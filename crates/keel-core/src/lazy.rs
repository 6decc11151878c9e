//! Deferred-loading cells for relationship attributes.
//!
//! A [`LazyReference`] wraps a [`ValueProducer`] and caches what it produces
//! on first access. The shared cache holds entities whose relationships are
//! `LazyReference`s; units of work decorate them (see
//! [`ValueHolderInterface`]) so each transaction triggers its own private
//! clone.
//!
//! # States
//!
//! - **Pending**: deferred, producer not run yet
//! - **Instantiated**: value cached, immutable from then on
//!
//! A resolved reference is created instantiated and has no producer.

use crate::Result;
use crate::entity::Managed;
use crate::error::Error;
use crate::producer::ValueProducer;
use crate::scope::TransactionScope;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Deferred, cached value of a relationship attribute.
pub struct LazyReference<T> {
    /// Cached value once instantiated.
    value: RwLock<Option<Arc<T>>>,
    /// Producer for deferred references; `None` once built resolved.
    producer: Option<Box<dyn ValueProducer<T>>>,
    /// Serializes triggers of this reference, including those made through
    /// working-copy decorators. Reentrant so a decorator holding it can
    /// still call [`LazyReference::get`].
    trigger_lock: ReentrantMutex<()>,
}

impl<T: Send + Sync + 'static> LazyReference<T> {
    /// A reference whose value is already known.
    pub fn resolved(value: T) -> Self {
        Self {
            value: RwLock::new(Some(Arc::new(value))),
            producer: None,
            trigger_lock: ReentrantMutex::new(()),
        }
    }

    /// A reference computed by `producer` on first access.
    pub fn deferred(producer: impl ValueProducer<T> + 'static) -> Self {
        Self {
            value: RwLock::new(None),
            producer: Some(Box::new(producer)),
            trigger_lock: ReentrantMutex::new(()),
        }
    }

    /// Return the value, running the producer on first call.
    ///
    /// A producer failure propagates and leaves the reference
    /// un-instantiated, so a later call retries.
    pub fn get(&self) -> Result<Arc<T>> {
        if let Some(v) = self.value.read().as_ref() {
            return Ok(Arc::clone(v));
        }

        let _trigger = self.trigger_lock.lock();
        if let Some(v) = self.value.read().as_ref() {
            return Ok(Arc::clone(v));
        }

        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| Error::invalid_state("lazy reference has neither value nor producer"))?;
        tracing::trace!(
            value_type = std::any::type_name::<T>(),
            "Instantiating lazy reference"
        );
        let produced = Arc::new(producer.produce()?);
        *self.value.write() = Some(Arc::clone(&produced));
        Ok(produced)
    }

    /// Report whether the value is cached, without computing it.
    pub fn is_instantiated(&self) -> bool {
        self.value.read().is_some()
    }

    /// Will [`get`](Self::get) return without touching storage?
    pub fn is_easily_instantiated(&self) -> bool {
        self.is_instantiated()
            || self
                .producer
                .as_ref()
                .is_none_or(|p| p.is_easily_instantiated())
    }

    /// Is this reference backed by a producer (as opposed to resolved)?
    pub fn is_deferred(&self) -> bool {
        self.producer.is_some()
    }

    /// Does triggering this reference take pessimistic row locks?
    pub fn is_pessimistic_locking(&self) -> bool {
        self.producer
            .as_ref()
            .is_some_and(|p| p.is_pessimistic_locking())
    }

    /// Acquire this reference's trigger lock.
    ///
    /// Decorators hold it for the whole of their trigger so that triggers of
    /// the same shared reference never interleave.
    pub fn lock_for_trigger(&self) -> ReentrantMutexGuard<'_, ()> {
        self.trigger_lock.lock()
    }

    /// Compute the value for one transaction without caching it here.
    ///
    /// Used when the transaction already holds a storage transaction, so the
    /// read must go through it.
    pub fn instantiate_for_unit_of_work(&self, scope: &dyn TransactionScope) -> Result<T>
    where
        T: Clone,
    {
        match &self.producer {
            Some(producer) => producer.produce_for_transaction(scope),
            None => self.get().map(|v| (*v).clone()),
        }
    }

    /// The value as already present in the transaction's working set, if the
    /// producer can find it there.
    pub fn value_in_transaction(&self, scope: &dyn TransactionScope) -> Result<Option<T>> {
        match &self.producer {
            Some(producer) => producer.lookup_in_transaction(scope),
            None => Ok(None),
        }
    }

    /// Drop the cached value of a pessimistic reference so the next access
    /// reads (and locks) again.
    pub fn reset(&self) -> Result<()> {
        if !self.is_pessimistic_locking() {
            return Err(Error::invalid_state(
                "only pessimistic lazy references can be reset",
            ));
        }
        let _trigger = self.trigger_lock.lock();
        *self.value.write() = None;
        Ok(())
    }
}

impl<T> fmt::Debug for LazyReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.value.read().is_some() {
            "instantiated"
        } else {
            "pending"
        };
        f.debug_struct("LazyReference")
            .field("state", &state)
            .field("deferred", &self.producer.is_some())
            .finish_non_exhaustive()
    }
}

/// The contract of a working-copy decorator around a [`LazyReference`].
///
/// Implemented by the session crate; the core only needs to route entity
/// attribute access through it.
pub trait ValueHolderInterface<T>: Send + Sync {
    /// Trigger the decorator and return its private working value.
    fn value(&self) -> Result<Managed<T>>;

    fn is_instantiated(&self) -> bool;

    fn is_easily_instantiated(&self) -> bool;

    fn is_pessimistic_locking(&self) -> bool;

    /// Does the working value differ from the backup taken when it was
    /// triggered?
    fn has_changed(&self) -> bool;

    /// Produce the shared reference an original should hold once this
    /// working copy is merged back.
    fn release_for_merge(&self) -> Result<Arc<LazyReference<T>>>;

    /// Cut the link to the shared reference after a merge.
    fn sever(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A relationship attribute of an entity.
///
/// Originals in the shared cache hold `Shared` references; working copies
/// hold `Decorated` ones.
pub enum ValueHolder<T> {
    Shared(Arc<LazyReference<T>>),
    Decorated(Arc<dyn ValueHolderInterface<T>>),
}

impl<T: Clone + Send + Sync + 'static> ValueHolder<T> {
    pub fn resolved(value: T) -> Self {
        ValueHolder::Shared(Arc::new(LazyReference::resolved(value)))
    }

    pub fn deferred(producer: impl ValueProducer<T> + 'static) -> Self {
        ValueHolder::Shared(Arc::new(LazyReference::deferred(producer)))
    }

    /// Return a snapshot of the value, triggering the holder if needed.
    pub fn get(&self) -> Result<T> {
        match self {
            ValueHolder::Shared(lazy) => lazy.get().map(|v| (*v).clone()),
            ValueHolder::Decorated(decorator) => {
                let working = decorator.value()?;
                let snapshot = working.read().clone();
                Ok(snapshot)
            }
        }
    }

    /// The mutable working value of a decorated holder.
    ///
    /// Shared references belong to the cache and cannot be edited in place.
    pub fn working_value(&self) -> Result<Managed<T>> {
        match self {
            ValueHolder::Shared(_) => Err(Error::invalid_state(
                "shared lazy references are read-only; read the entity through a unit of work",
            )),
            ValueHolder::Decorated(decorator) => decorator.value(),
        }
    }

    pub fn is_instantiated(&self) -> bool {
        match self {
            ValueHolder::Shared(lazy) => lazy.is_instantiated(),
            ValueHolder::Decorated(decorator) => decorator.is_instantiated(),
        }
    }

    pub fn is_easily_instantiated(&self) -> bool {
        match self {
            ValueHolder::Shared(lazy) => lazy.is_easily_instantiated(),
            ValueHolder::Decorated(decorator) => decorator.is_easily_instantiated(),
        }
    }

    pub fn is_pessimistic_locking(&self) -> bool {
        match self {
            ValueHolder::Shared(lazy) => lazy.is_pessimistic_locking(),
            ValueHolder::Decorated(decorator) => decorator.is_pessimistic_locking(),
        }
    }

    pub fn shared_reference(&self) -> Option<&Arc<LazyReference<T>>> {
        match self {
            ValueHolder::Shared(lazy) => Some(lazy),
            ValueHolder::Decorated(_) => None,
        }
    }

    pub fn decorator(&self) -> Option<&Arc<dyn ValueHolderInterface<T>>> {
        match self {
            ValueHolder::Shared(_) => None,
            ValueHolder::Decorated(decorator) => Some(decorator),
        }
    }
}

impl<T> Clone for ValueHolder<T> {
    fn clone(&self) -> Self {
        match self {
            ValueHolder::Shared(lazy) => ValueHolder::Shared(Arc::clone(lazy)),
            ValueHolder::Decorated(decorator) => ValueHolder::Decorated(Arc::clone(decorator)),
        }
    }
}

/// Holders are equal when they share the same reference, so entities holding
/// them can still derive `PartialEq`.
impl<T> PartialEq for ValueHolder<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueHolder::Shared(a), ValueHolder::Shared(b)) => Arc::ptr_eq(a, b),
            (ValueHolder::Decorated(a), ValueHolder::Decorated(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> fmt::Debug for ValueHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueHolder::Shared(lazy) => f.debug_tuple("Shared").field(lazy).finish(),
            ValueHolder::Decorated(decorator) => f
                .debug_struct("Decorated")
                .field("instantiated", &decorator.is_instantiated())
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageErrorKind;
    use crate::producer::ClosureProducer;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_runs_producer_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = LazyReference::deferred(ClosureProducer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        }));

        assert!(!lazy.is_instantiated());
        assert!(!lazy.is_easily_instantiated());
        let first = lazy.get().unwrap();
        let second = lazy.get().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_instantiated());
        assert!(lazy.is_easily_instantiated());
    }

    #[test]
    fn test_failed_produce_is_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = LazyReference::deferred(ClosureProducer::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::storage(StorageErrorKind::Io, "connection reset"))
            } else {
                Ok("loaded".to_string())
            }
        }));

        let err = lazy.get().unwrap_err();
        assert!(err.is_retryable());
        assert!(!lazy.is_instantiated());

        assert_eq!(*lazy.get().unwrap(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_get_instantiates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = LazyReference::deferred(ClosureProducer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(42_i64)
        }));
        let barrier = Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    assert_eq!(*lazy.get().unwrap(), 42);
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolved_reference() {
        let lazy = LazyReference::resolved(7_u8);
        assert!(lazy.is_instantiated());
        assert!(lazy.is_easily_instantiated());
        assert!(!lazy.is_deferred());
        assert!(!lazy.is_pessimistic_locking());
        assert!(lazy.reset().is_err());
    }

    #[test]
    fn test_trigger_lock_is_reentrant() {
        let lazy = LazyReference::deferred(ClosureProducer::new(|| Ok(1_i32)));
        let _held = lazy.lock_for_trigger();
        assert_eq!(*lazy.get().unwrap(), 1);
    }

    #[test]
    fn test_shared_holder_is_read_only() {
        let holder = ValueHolder::resolved(vec!["a".to_string()]);
        assert_eq!(holder.get().unwrap(), vec!["a".to_string()]);
        assert!(matches!(
            holder.working_value(),
            Err(Error::InvalidState(_))
        ));
        assert!(holder.shared_reference().is_some());
        assert!(holder.decorator().is_none());
    }

    #[test]
    fn test_holders_compare_by_reference() {
        let holder = ValueHolder::resolved(1_i64);
        let same = holder.clone();
        let other = ValueHolder::resolved(1_i64);
        assert_eq!(holder, same);
        assert_ne!(holder, other);
    }
}
