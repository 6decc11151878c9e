//! Shared cache and units of work for Keel.
//!
//! `keel-session` is the **transaction isolation layer**. A [`SharedSession`]
//! caches one original per entity key; a [`UnitOfWork`] works on private
//! clones of those originals and publishes them back only after its storage
//! transaction commits.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per key, both in the shared
//!   cache and inside each unit of work.
//! - **Working-copy references**: relationship attributes of a working copy
//!   are wrapped in [`WorkingCopyLazyReference`] decorators that load and
//!   clone the target on first access, never touching the shared original.
//! - **Optimistic locking**: writes of lock-guarded kinds are checked and
//!   guarded with the markers from `keel-locking`.
//! - **Change tracking**: only columns that changed since the working copy
//!   was read are written.
//!
//! # Example
//!
//! ```ignore
//! let shared = SharedSession::new(datastore);
//! shared.register_descriptor(
//!     EntityDescriptor::new::<Account>()
//!         .with_lock_policy(OptimisticLockPolicy::counter("version"))
//!         .with_relationship("owner", account_owner),
//! );
//!
//! let uow = shared.acquire_unit_of_work();
//! let account = uow.read::<Account>(&[Value::BigInt(1)])?.expect("exists");
//! account.write().balance += 100;
//! uow.commit()?;
//! ```

pub mod change_tracker;
pub mod commit;
pub mod config;
pub mod descriptor;
pub mod identity_map;
pub mod memory;
pub mod shared;
pub mod unit_of_work;
pub mod working_copy;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use commit::{CommitManager, CommitOrderer, CommitPlan, CommitState, CommitSummary, PendingOp};
pub use config::SessionConfig;
pub use descriptor::{AttributeMapping, EntityDescriptor, OriginalResolver, RelationshipMapping};
pub use identity_map::IdentityMap;
pub use memory::{MemoryDatastore, ReadStats};
pub use shared::SharedSession;
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitStatus};
pub use working_copy::{
    CloneStrategy, PlainClone, SeverReason, TransportedReference, WorkingCopyLazyReference,
    working_copy_reference,
};
