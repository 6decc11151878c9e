//! Locking policy configuration.

use keel_core::{ConfigErrorKind, Error, Result};
use serde::{Deserialize, Serialize};

/// Where timestamp markers get their time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    /// Ask the datastore server for its clock.
    #[default]
    Server,
    /// Use the local process clock.
    Local,
}

/// What to do when a new timestamp marker equals the current one.
///
/// Two writes within the same clock tick produce equal timestamps, so the
/// second write cannot be told apart from a stale one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieHandling {
    /// Reject the write as a concurrency violation.
    #[default]
    Conflict,
    /// Let the write through with the equal marker.
    Ignore,
}

/// Where the marker of a locked entity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockValueStorage {
    /// A mapped field of the entity holds the marker.
    #[default]
    InObject,
    /// Only the row and the shared cache hold the marker.
    InCache,
}

/// Marker strategy and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockStrategyConfig {
    Counter {
        #[serde(default = "default_initial_value")]
        initial_value: i64,
    },
    Timestamp {
        #[serde(default)]
        time_source: TimeSource,
    },
}

fn default_initial_value() -> i64 {
    1
}

/// Configuration for one entity's optimistic locking.
///
/// # Example
///
/// ```
/// use keel_locking::{LockPolicyConfig, TieHandling};
///
/// let config = LockPolicyConfig::from_json_str(
///     r#"{"field": "updated_at", "strategy": {"type": "timestamp", "time_source": "local"}}"#,
/// )
/// .unwrap();
/// assert_eq!(config.ties, TieHandling::Conflict);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicyConfig {
    /// Column holding the marker.
    pub field: String,
    pub strategy: LockStrategyConfig,
    #[serde(default)]
    pub storage: LockValueStorage,
    #[serde(default)]
    pub ties: TieHandling,
}

impl LockPolicyConfig {
    /// Version counter starting at 1.
    pub fn counter(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            strategy: LockStrategyConfig::Counter {
                initial_value: default_initial_value(),
            },
            storage: LockValueStorage::default(),
            ties: TieHandling::default(),
        }
    }

    /// Timestamp taken from the server clock.
    pub fn timestamp(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            strategy: LockStrategyConfig::Timestamp {
                time_source: TimeSource::default(),
            },
            storage: LockValueStorage::default(),
            ties: TieHandling::default(),
        }
    }

    /// Set the counter's first value. No effect on timestamp strategies.
    #[must_use]
    pub fn initial_value(mut self, value: i64) -> Self {
        if let LockStrategyConfig::Counter { initial_value } = &mut self.strategy {
            *initial_value = value;
        }
        self
    }

    /// Set the time source. No effect on counter strategies.
    #[must_use]
    pub fn time_source(mut self, source: TimeSource) -> Self {
        if let LockStrategyConfig::Timestamp { time_source } = &mut self.strategy {
            *time_source = source;
        }
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: LockValueStorage) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn ties(mut self, ties: TieHandling) -> Self {
        self.ties = ties;
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::config(
                ConfigErrorKind::Invalid,
                format!("invalid lock policy configuration: {e}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(Error::config(
                ConfigErrorKind::Invalid,
                "lock policy field name must not be empty",
            ));
        }
        Ok(())
    }
}
