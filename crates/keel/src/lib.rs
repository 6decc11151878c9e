//! Keel - transaction-isolated working copies with lazy relationships and
//! optimistic locking.
//!
//! Keel keeps one shared cache of entity originals per datastore. Every
//! transaction works on private clones of those originals; relationship
//! attributes of a clone load lazily and are cloned again on first access,
//! so no transaction ever sees another's uncommitted edits. Writes are
//! guarded by a per-entity optimistic lock (a version counter or a
//! timestamp), and a stale write aborts only its own commit.
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! #[derive(Debug, Clone)]
//! struct Account {
//!     id: i64,
//!     balance: i64,
//!     version: i64,
//!     owner_id: i64,
//!     owner: ValueHolder<Option<Customer>>,
//! }
//!
//! fn account_owner(account: &Account) -> &ValueHolder<Option<Customer>> {
//!     &account.owner
//! }
//!
//! let store = Arc::new(MemoryDatastore::new("bank"));
//! let shared = SharedSession::new(store);
//! shared.register_descriptor(
//!     EntityDescriptor::new::<Account>()
//!         .with_lock_policy(OptimisticLockPolicy::counter("version"))
//!         .with_relationship("owner", account_owner)
//!         .depends_on("customers"),
//! );
//!
//! let uow = shared.acquire_unit_of_work();
//! let account = uow.read::<Account>(&[Value::BigInt(1)])?.expect("seeded");
//! account.write().balance -= 50;
//! match uow.commit() {
//!     Ok(summary) => println!("wrote {} rows", summary.total()),
//!     Err(e) if e.is_concurrency_violation() => println!("someone else won: {e}"),
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! # Crates
//!
//! - `keel-core`: values, rows, errors, entities and lazy references
//! - `keel-locking`: optimistic lock policies and clocks
//! - `keel-session`: the shared cache, units of work and the in-memory datastore

pub use keel_core::{
    ClosureProducer, ColumnGuard, ColumnUpdate, ConcurrencyViolation, ConfigError,
    ConfigErrorKind, Datastore, DatastoreTransaction, Entity, EntityKey, ErasedEntity, Error,
    HolderMapper, LazyReference, LoadContext, LockMarker, LockMode, Managed, MarkerKind,
    ResolutionError, Result, Row, SessionChain, StorageError, StorageErrorKind, ToManyProducer,
    ToOneProducer, TransactionScope, TypeError, UnsupportedOperationError, Value, ValueHolder,
    ValueHolderInterface, ValueProducer, ViolationReason, downcast_entity, outermost_session,
};

pub use keel_locking::{
    Clock, LockPolicyConfig, LockStrategy, LockStrategyConfig, LockValueStorage, ManualClock,
    OptimisticLockPolicy, SystemClock, TieHandling, TimeSource, WriteLockCache,
};

pub use keel_session::{
    AttributeMapping, ChangeTracker, CloneStrategy, CommitManager, CommitOrderer, CommitPlan,
    CommitState, CommitSummary, EntityDescriptor, IdentityMap, MemoryDatastore, ObjectSnapshot,
    OriginalResolver, PendingCounts, PendingOp, PlainClone, ReadStats, RelationshipMapping,
    SessionConfig, SeverReason, SharedSession, TransportedReference, UnitOfWork, UnitStatus,
    WorkingCopyLazyReference, working_copy_reference,
};

/// Everything needed to map entities and run units of work.
pub mod prelude {
    pub use crate::{
        // Mapping
        Entity,
        EntityDescriptor,
        EntityKey,
        Error,
        HolderMapper,
        LoadContext,
        // Locking
        LockMarker,
        LockValueStorage,
        Managed,
        MemoryDatastore,
        OptimisticLockPolicy,
        Result,
        Row,
        SessionConfig,
        // Sessions
        SharedSession,
        TieHandling,
        UnitOfWork,
        Value,
        ValueHolder,
    };
    pub use std::sync::Arc;
}
