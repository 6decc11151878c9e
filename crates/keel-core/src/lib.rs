//! Core types and traits for Keel.
//!
//! This crate provides the building blocks shared by the locking and session
//! crates:
//!
//! - `Value` and `Row` for data exchanged with storage
//! - `Error` and `Result` used across the workspace
//! - `Entity` and `EntityKey` for mapped structs and their identity
//! - `LazyReference` and `ValueHolder` for deferred relationships
//! - `LockMarker` for optimistic-lock versions
//! - `Datastore`, `TransactionScope` and `SessionChain` collaborator traits

pub mod datastore;
pub mod entity;
pub mod error;
pub mod lazy;
pub mod marker;
pub mod producer;
pub mod row;
pub mod scope;
pub mod value;

pub use datastore::{ColumnGuard, ColumnUpdate, Datastore, DatastoreTransaction, LockMode};
pub use entity::{Entity, EntityKey, ErasedEntity, HolderMapper, Managed, downcast_entity};
pub use error::{
    ConcurrencyViolation, ConfigError, ConfigErrorKind, Error, ResolutionError, Result,
    StorageError, StorageErrorKind, TypeError, UnsupportedOperationError, ViolationReason,
};
pub use lazy::{LazyReference, ValueHolder, ValueHolderInterface};
pub use marker::{LockMarker, MarkerKind, compare_optional};
pub use producer::{ClosureProducer, LoadContext, ToManyProducer, ToOneProducer, ValueProducer};
pub use row::{ColumnInfo, Row};
pub use scope::{SessionChain, TransactionScope, outermost_session};
pub use value::Value;
