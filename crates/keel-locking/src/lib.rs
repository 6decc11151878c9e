//! Optimistic locking for Keel.
//!
//! An [`OptimisticLockPolicy`] guards one entity kind with either a version
//! counter or a timestamp. The session crate asks it, at commit time, whether
//! a working copy's marker is still current and which marker to write next.

pub mod clock;
pub mod config;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LockPolicyConfig, LockStrategyConfig, LockValueStorage, TieHandling, TimeSource};
pub use policy::{LockStrategy, OptimisticLockPolicy, WriteLockCache};
