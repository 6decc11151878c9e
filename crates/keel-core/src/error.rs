//! Error types for Keel operations.

use crate::entity::EntityKey;
use crate::marker::LockMarker;
use std::fmt;

/// The primary error type for all Keel operations.
#[derive(Debug)]
pub enum Error {
    /// A value (often an optimistic-lock marker) had an unexpected runtime kind
    TypeMismatch(TypeError),
    /// The operation is not meaningful for this kind of value
    UnsupportedOperation(UnsupportedOperationError),
    /// An object was used in a state that does not allow the operation
    InvalidState(String),
    /// A detached reference could not locate its original entity
    Resolution(ResolutionError),
    /// Errors raised by the datastore (I/O, locks, constraints)
    Storage(StorageError),
    /// Optimistic lock check failed at commit time
    Concurrency(ConcurrencyViolation),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl TypeError {
    pub fn new(expected: &'static str, actual: impl Into<String>) -> Self {
        Self {
            expected,
            actual: actual.into(),
            column: None,
        }
    }

    #[must_use]
    pub fn in_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct UnsupportedOperationError {
    /// The operation that was attempted, e.g. `"increment"`.
    pub operation: &'static str,
    /// What it was attempted on, e.g. `"timestamp marker"`.
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ResolutionError {
    pub entity: EntityKey,
    pub attribute: String,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Reading or writing the underlying store failed
    Io,
    /// The addressed table or row does not exist
    NotFound,
    /// The row is locked by another transaction
    Locked,
    /// Constraint violation (duplicate key, etc.)
    Constraint,
    /// Transaction already finished or not started
    Transaction,
}

/// A write was rejected because another transaction changed the row first.
#[derive(Debug, Clone)]
pub struct ConcurrencyViolation {
    /// Identity of the entity whose write was rejected.
    pub entity: EntityKey,
    /// Marker held by the working copy that attempted the write.
    pub expected: Option<LockMarker>,
    /// Marker currently visible in the shared cache or the row.
    pub found: Option<LockMarker>,
    pub reason: ViolationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationReason {
    /// The working copy's marker is older than the cached marker
    StaleVersion,
    /// The new marker is not newer than the current one (equal timestamps)
    TimestampTie,
    /// The guarded write matched no row: the stored marker changed
    RowChanged,
    /// The row to update or delete no longer exists
    RowMissing,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// The lock field stored in the object is not of the policy's marker type
    MarkerTypeMapping,
    /// A descriptor, mapping or policy required for the operation is missing
    Missing,
    /// A configuration document could not be interpreted
    Invalid,
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    /// Shorthand for a storage error without a source.
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a configuration error.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a concurrency violation detected by optimistic locking?
    pub fn is_concurrency_violation(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// Can the failed operation be retried as-is?
    ///
    /// Storage I/O failures and lock contention leave lazy references
    /// un-instantiated, so a later trigger may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError {
                kind: StorageErrorKind::Io | StorageErrorKind::Locked,
                ..
            })
        )
    }

    /// The concurrency violation carried by this error, if any.
    pub fn as_concurrency_violation(&self) -> Option<&ConcurrencyViolation> {
        match self {
            Error::Concurrency(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TypeMismatch(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::UnsupportedOperation(e) => {
                write!(f, "Unsupported operation: cannot {} a {}", e.operation, e.target)
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Resolution(e) => write!(
                f,
                "Resolution error for {}.{}: {}",
                e.entity, e.attribute, e.message
            ),
            Error::Storage(e) => write!(f, "Storage error ({:?}): {}", e.kind, e.message),
            Error::Concurrency(v) => write!(f, "{}", v),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ConcurrencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |m: &Option<LockMarker>| m.map_or_else(|| "none".to_string(), |m| m.to_string());
        write!(
            f,
            "Optimistic lock violation on {} ({:?}): working copy has {}, store has {}",
            self.entity,
            self.reason,
            show(&self.expected),
            show(&self.found)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(StorageError {
            kind: StorageErrorKind::Io,
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConcurrencyViolation> for Error {
    fn from(v: ConcurrencyViolation) -> Self {
        Error::Concurrency(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn test_type_error_display_with_column() {
        let err = Error::TypeMismatch(TypeError::new("TIMESTAMP", "TEXT").in_column("updated_at"));
        assert_eq!(
            err.to_string(),
            "Type error in column 'updated_at': expected TIMESTAMP, found TEXT"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::storage(StorageErrorKind::Io, "disk").is_retryable());
        assert!(Error::storage(StorageErrorKind::Locked, "row").is_retryable());
        assert!(!Error::storage(StorageErrorKind::Constraint, "dup").is_retryable());
        assert!(!Error::invalid_state("x").is_retryable());
    }

    #[test]
    fn test_concurrency_violation_display_carries_both_markers() {
        let v = ConcurrencyViolation {
            entity: EntityKey::new("accounts", vec![Value::BigInt(7)]),
            expected: Some(LockMarker::Counter(1)),
            found: Some(LockMarker::Counter(2)),
            reason: ViolationReason::StaleVersion,
        };
        let err: Error = v.into();
        assert!(err.is_concurrency_violation());
        let text = err.to_string();
        assert!(text.contains("accounts[7]"), "{text}");
        assert!(text.contains("v1"), "{text}");
        assert!(text.contains("v2"), "{text}");
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error as _;
        let err: Error = std::io::Error::other("boom").into();
        assert!(err.source().is_some());
        assert!(err.is_retryable());
    }
}
