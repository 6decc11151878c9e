//! Optimistic locking policies.
//!
//! A policy owns one marker column per locked entity. It reads markers from
//! rows, objects and the shared cache, orders them, and computes the marker
//! the next write stores. The session consults it at commit:
//!
//! 1. the working copy's marker must not be older than the cached one
//! 2. the new marker must be newer than the working copy's marker
//! 3. the storage write is guarded by the working copy's marker

use crate::clock::{Clock, SystemClock};
use crate::config::{LockPolicyConfig, LockStrategyConfig, LockValueStorage, TieHandling, TimeSource};
use keel_core::{
    ColumnUpdate, ConfigErrorKind, EntityKey, Error, LockMarker, MarkerKind, Result, Row,
    SessionChain, TypeError, UnsupportedOperationError, Value, compare_optional,
    outermost_session,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to the markers stored in a shared cache.
pub trait WriteLockCache {
    /// The marker cached for `key`, if the cache holds one.
    fn write_lock_value(&self, key: &EntityKey) -> Option<LockMarker>;
}

impl WriteLockCache for HashMap<EntityKey, LockMarker> {
    fn write_lock_value(&self, key: &EntityKey) -> Option<LockMarker> {
        self.get(key).copied()
    }
}

/// How new markers are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// `previous + 1`, starting at `initial_value`.
    Counter { initial_value: i64 },
    /// The current time from `time_source`.
    Timestamp { time_source: TimeSource },
}

/// The optimistic locking policy of one entity kind.
#[derive(Debug, Clone)]
pub struct OptimisticLockPolicy {
    field: String,
    strategy: LockStrategy,
    storage: LockValueStorage,
    ties: TieHandling,
    clock: Arc<dyn Clock>,
}

impl OptimisticLockPolicy {
    /// A version counter stored in `field`, starting at 1.
    pub fn counter(field: impl Into<String>) -> Self {
        Self::new(field, LockStrategy::Counter { initial_value: 1 })
    }

    /// A timestamp stored in `field`, taken from the server clock.
    pub fn timestamp(field: impl Into<String>) -> Self {
        Self::new(
            field,
            LockStrategy::Timestamp {
                time_source: TimeSource::Server,
            },
        )
    }

    fn new(field: impl Into<String>, strategy: LockStrategy) -> Self {
        Self {
            field: field.into(),
            strategy,
            storage: LockValueStorage::InObject,
            ties: TieHandling::Conflict,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &LockPolicyConfig) -> Result<Self> {
        config.validate()?;
        let strategy = match config.strategy {
            LockStrategyConfig::Counter { initial_value } => LockStrategy::Counter { initial_value },
            LockStrategyConfig::Timestamp { time_source } => LockStrategy::Timestamp { time_source },
        };
        Ok(Self::new(config.field.clone(), strategy)
            .with_storage(config.storage)
            .with_ties(config.ties))
    }

    /// Use `clock` as the local time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: LockValueStorage) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_ties(mut self, ties: TieHandling) -> Self {
        self.ties = ties;
        self
    }

    #[must_use]
    pub fn with_initial_value(mut self, value: i64) -> Self {
        if let LockStrategy::Counter { initial_value } = &mut self.strategy {
            *initial_value = value;
        }
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn storage(&self) -> LockValueStorage {
        self.storage
    }

    pub fn ties(&self) -> TieHandling {
        self.ties
    }

    pub fn marker_kind(&self) -> MarkerKind {
        match self.strategy {
            LockStrategy::Counter { .. } => MarkerKind::Counter,
            LockStrategy::Timestamp { .. } => MarkerKind::Timestamp,
        }
    }

    /// Is the marker kept only in the cache (and row)?
    pub fn stores_in_cache(&self) -> bool {
        self.storage == LockValueStorage::InCache
    }

    // ==================== Time source ====================

    /// Switch a timestamp policy between server and local time. Counters
    /// ignore the setting.
    pub fn set_uses_server_time(&mut self, uses_server_time: bool) {
        if let LockStrategy::Timestamp { time_source } = &mut self.strategy {
            *time_source = if uses_server_time {
                TimeSource::Server
            } else {
                TimeSource::Local
            };
        }
    }

    pub fn use_local_time(&mut self) {
        self.set_uses_server_time(false);
    }

    pub fn use_server_time(&mut self) {
        self.set_uses_server_time(true);
    }

    pub fn uses_local_time(&self) -> bool {
        matches!(
            self.strategy,
            LockStrategy::Timestamp {
                time_source: TimeSource::Local
            }
        )
    }

    pub fn uses_server_time(&self) -> bool {
        matches!(
            self.strategy,
            LockStrategy::Timestamp {
                time_source: TimeSource::Server
            }
        )
    }

    // ==================== Conversion ====================

    /// Interpret a raw column value as a marker of this policy's kind.
    ///
    /// NULL is an absent marker. A value of the wrong kind is a type mismatch.
    pub fn convert_marker(&self, raw: &Value) -> Result<Option<LockMarker>> {
        if raw.is_null() {
            return Ok(None);
        }
        let converted = match self.strategy {
            LockStrategy::Counter { .. } => raw.as_i64().map(LockMarker::Counter),
            LockStrategy::Timestamp { .. } => match raw {
                Value::Timestamp(micros) | Value::TimestampTz(micros) | Value::BigInt(micros) => {
                    Some(LockMarker::Timestamp(*micros))
                }
                Value::Text(text) => chrono::DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| LockMarker::Timestamp(dt.timestamp_micros())),
                _ => None,
            },
        };
        converted.map(Some).ok_or_else(|| {
            Error::TypeMismatch(
                TypeError::new(self.marker_kind().name(), raw.type_name()).in_column(&self.field),
            )
        })
    }

    /// The marker of a row, read from this policy's column.
    pub fn marker_from_row(&self, row: &Row) -> Result<Option<LockMarker>> {
        match row.get_by_name(&self.field) {
            Some(raw) => self.convert_marker(raw),
            None => Ok(None),
        }
    }

    // ==================== Comparison ====================

    /// Order two markers. Absent is older than any concrete marker; markers
    /// of another kind are a type mismatch.
    pub fn compare(&self, a: Option<&LockMarker>, b: Option<&LockMarker>) -> Result<Ordering> {
        for marker in [a, b].into_iter().flatten() {
            self.check_kind(marker)?;
        }
        compare_optional(a, b)
    }

    /// Order two raw column values as markers.
    pub fn compare_values(&self, a: &Value, b: &Value) -> Result<Ordering> {
        let a = self.convert_marker(a)?;
        let b = self.convert_marker(b)?;
        self.compare(a.as_ref(), b.as_ref())
    }

    fn check_kind(&self, marker: &LockMarker) -> Result<()> {
        if marker.kind() == self.marker_kind() {
            Ok(())
        } else {
            Err(Error::TypeMismatch(
                TypeError::new(self.marker_kind().name(), marker.kind().name())
                    .in_column(&self.field),
            ))
        }
    }

    /// How `incoming` relates to the marker currently known for the object.
    ///
    /// An absent incoming marker carries no version information and is
    /// treated as equal.
    #[tracing::instrument(level = "trace", skip(self, object, cache), fields(field = %self.field))]
    pub fn version_difference(
        &self,
        incoming: Option<&LockMarker>,
        object: &Row,
        key: &EntityKey,
        cache: &dyn WriteLockCache,
    ) -> Result<Ordering> {
        let Some(incoming) = incoming else {
            return Ok(Ordering::Equal);
        };
        let current = self.write_lock_value(object, key, cache)?;
        self.compare(Some(incoming), current.as_ref())
    }

    /// Is `first` strictly newer than `second`?
    ///
    /// An absent `first` is never newer; a concrete `first` is always newer
    /// than an absent `second`.
    pub fn is_newer_version(
        &self,
        first: Option<&LockMarker>,
        second: Option<&LockMarker>,
    ) -> Result<bool> {
        match (first, second) {
            (None, _) => Ok(false),
            (Some(first), None) => self.check_kind(first).map(|()| true),
            (Some(_), Some(_)) => Ok(self.compare(first, second)? == Ordering::Greater),
        }
    }

    /// Is `current` newer than the marker of the live object?
    pub fn is_newer_version_than_object(
        &self,
        current: Option<&LockMarker>,
        object: &Row,
        key: &EntityKey,
        cache: &dyn WriteLockCache,
    ) -> Result<bool> {
        let existing = self.write_lock_value(object, key, cache)?;
        self.is_newer_version(current, existing.as_ref())
    }

    /// Is the marker in `row` newer than the marker of the live object?
    pub fn is_newer_version_from_row(
        &self,
        row: &Row,
        object: &Row,
        key: &EntityKey,
        cache: &dyn WriteLockCache,
    ) -> Result<bool> {
        let incoming = self.marker_from_row(row)?;
        self.is_newer_version_than_object(incoming.as_ref(), object, key, cache)
    }

    /// Is the raw value `first` newer than the raw value `second`?
    pub fn is_newer_version_of_values(&self, first: &Value, second: &Value) -> Result<bool> {
        let first = self.convert_marker(first)?;
        let second = self.convert_marker(second)?;
        self.is_newer_version(first.as_ref(), second.as_ref())
    }

    /// May a write replace `current` with `successor`?
    ///
    /// Strictly newer markers are always accepted; equal markers only when
    /// ties are ignored.
    pub fn accepts_successor(
        &self,
        current: Option<&LockMarker>,
        successor: &LockMarker,
    ) -> Result<bool> {
        if self.is_newer_version(Some(successor), current)? {
            return Ok(true);
        }
        Ok(self.ties == TieHandling::Ignore
            && self.compare(Some(successor), current)? == Ordering::Equal)
    }

    // ==================== New markers ====================

    /// The oldest possible marker.
    pub fn base_value(&self) -> LockMarker {
        match self.strategy {
            LockStrategy::Counter { .. } => LockMarker::Counter(0),
            LockStrategy::Timestamp { .. } => LockMarker::Timestamp(0),
        }
    }

    /// The marker written with a newly inserted row.
    pub fn initial_write_value(&self, session: &dyn SessionChain) -> Result<LockMarker> {
        match self.strategy {
            LockStrategy::Counter { initial_value } => Ok(LockMarker::Counter(initial_value)),
            LockStrategy::Timestamp { .. } => self.current_time(session),
        }
    }

    /// The marker the next write of an object holding `previous` stores.
    #[tracing::instrument(level = "trace", skip(self, session), fields(field = %self.field))]
    pub fn new_lock_value(
        &self,
        previous: Option<&LockMarker>,
        session: &dyn SessionChain,
    ) -> Result<LockMarker> {
        match (self.strategy, previous) {
            (LockStrategy::Counter { .. }, None) => self.initial_write_value(session),
            (LockStrategy::Counter { .. }, Some(previous)) => self.increment(previous),
            (LockStrategy::Timestamp { .. }, _) => self.current_time(session),
        }
    }

    /// Step a counter by one. Timestamps cannot be incremented.
    pub fn increment(&self, marker: &LockMarker) -> Result<LockMarker> {
        self.check_kind(marker)?;
        match marker {
            LockMarker::Counter(n) => n.checked_add(1).map(LockMarker::Counter).ok_or_else(|| {
                Error::invalid_state(format!("version counter {n} cannot be incremented"))
            }),
            LockMarker::Timestamp(_) => {
                Err(Error::UnsupportedOperation(UnsupportedOperationError {
                    operation: "increment",
                    target: "timestamp marker".to_string(),
                }))
            }
        }
    }

    /// The current time according to this policy's time source.
    ///
    /// Server time is asked on behalf of the outermost non-nested session.
    pub fn current_time(&self, session: &dyn SessionChain) -> Result<LockMarker> {
        match self.strategy {
            LockStrategy::Timestamp {
                time_source: TimeSource::Local,
            } => Ok(LockMarker::Timestamp(self.clock.now_micros())),
            LockStrategy::Timestamp {
                time_source: TimeSource::Server,
            } => {
                let outermost = outermost_session(session);
                let raw = outermost
                    .datastore()
                    .timestamp_from_server(outermost.session_name())?;
                tracing::trace!(
                    session = outermost.session_name(),
                    datastore = outermost.datastore().name(),
                    "Read timestamp from server"
                );
                self.convert_marker(&raw)?.ok_or_else(|| {
                    Error::invalid_state("datastore returned no server timestamp")
                })
            }
            LockStrategy::Counter { .. } => Err(Error::UnsupportedOperation(
                UnsupportedOperationError {
                    operation: "read the time of",
                    target: "counter policy".to_string(),
                },
            )),
        }
    }

    // ==================== Cache and object markers ====================

    /// The marker to store in the shared cache next to an entity built from
    /// `row`. Only in-cache policies store one.
    pub fn value_to_put_in_cache(&self, row: &Row) -> Result<Option<LockMarker>> {
        if self.stores_in_cache() {
            self.marker_from_row(row)
        } else {
            Ok(None)
        }
    }

    /// The marker currently held for an object: read from its mapped field,
    /// or from the cache when the policy stores markers in the cache.
    ///
    /// A mapped field of the wrong kind is a configuration error, not a type
    /// mismatch: the entity maps the lock field to the wrong type.
    pub fn write_lock_value(
        &self,
        object: &Row,
        key: &EntityKey,
        cache: &dyn WriteLockCache,
    ) -> Result<Option<LockMarker>> {
        if self.stores_in_cache() {
            return Ok(cache.write_lock_value(key));
        }
        let raw = object.get_by_name(&self.field).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::Missing,
                format!("{} does not map lock field '{}'", key.kind(), self.field),
            )
        })?;
        let marker = match (self.strategy, raw) {
            (_, Value::Null) => None,
            (LockStrategy::Counter { .. }, raw) if raw.as_i64().is_some() => {
                raw.as_i64().map(LockMarker::Counter)
            }
            (LockStrategy::Timestamp { .. }, Value::Timestamp(micros) | Value::TimestampTz(micros)) => {
                Some(LockMarker::Timestamp(*micros))
            }
            (_, other) => {
                return Err(Error::config(
                    ConfigErrorKind::MarkerTypeMapping,
                    format!(
                        "lock field '{}' of {} must map to a {} marker, found {}",
                        self.field,
                        key.kind(),
                        self.marker_kind().name(),
                        other.type_name()
                    ),
                ));
            }
        };
        Ok(marker)
    }

    /// The assignment that bumps the marker inside a bulk storage write.
    pub fn write_lock_update_fragment(&self) -> (String, ColumnUpdate) {
        let update = match self.strategy {
            LockStrategy::Counter { .. } => ColumnUpdate::Increment(1),
            LockStrategy::Timestamp {
                time_source: TimeSource::Server,
            } => ColumnUpdate::CurrentTimestamp,
            LockStrategy::Timestamp {
                time_source: TimeSource::Local,
            } => ColumnUpdate::Value(Value::Timestamp(self.clock.now_micros())),
        };
        (self.field.clone(), update)
    }
}
