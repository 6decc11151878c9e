//! Optimistic-lock version markers.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single comparable version value stored per locked row.
///
/// Counters and timestamps never compare with each other; asking for the
/// order of a counter against a timestamp is a type mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMarker {
    /// Monotonic version number.
    Counter(i64),
    /// Point in time, microseconds since the Unix epoch (UTC).
    Timestamp(i64),
}

/// The kind of marker a locking policy produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Counter,
    Timestamp,
}

impl MarkerKind {
    pub const fn name(self) -> &'static str {
        match self {
            MarkerKind::Counter => "counter",
            MarkerKind::Timestamp => "timestamp",
        }
    }
}

impl LockMarker {
    pub const fn kind(&self) -> MarkerKind {
        match self {
            LockMarker::Counter(_) => MarkerKind::Counter,
            LockMarker::Timestamp(_) => MarkerKind::Timestamp,
        }
    }

    /// The column value persisted for this marker.
    pub fn to_value(&self) -> Value {
        match self {
            LockMarker::Counter(n) => Value::BigInt(*n),
            LockMarker::Timestamp(micros) => Value::Timestamp(*micros),
        }
    }

    /// Order two markers of the same kind.
    pub fn try_cmp(&self, other: &LockMarker) -> Result<Ordering> {
        match (self, other) {
            (LockMarker::Counter(a), LockMarker::Counter(b))
            | (LockMarker::Timestamp(a), LockMarker::Timestamp(b)) => Ok(a.cmp(b)),
            _ => Err(Error::TypeMismatch(TypeError::new(
                self.kind().name(),
                other.kind().name(),
            ))),
        }
    }
}

/// Order two optional markers: absent sorts before any concrete marker and
/// equals another absent marker.
pub fn compare_optional(a: Option<&LockMarker>, b: Option<&LockMarker>) -> Result<Ordering> {
    match (a, b) {
        (None, None) => Ok(Ordering::Equal),
        (None, Some(_)) => Ok(Ordering::Less),
        (Some(_), None) => Ok(Ordering::Greater),
        (Some(a), Some(b)) => a.try_cmp(b),
    }
}

impl fmt::Display for LockMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMarker::Counter(n) => write!(f, "v{n}"),
            LockMarker::Timestamp(micros) => match chrono::DateTime::from_timestamp_micros(*micros)
            {
                Some(dt) => write!(
                    f,
                    "{}",
                    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
                ),
                None => write!(f, "ts({micros})"),
            },
        }
    }
}
