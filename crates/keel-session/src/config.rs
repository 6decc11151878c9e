//! Session configuration.

use keel_core::{ConfigErrorKind, Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a [`SharedSession`](crate::SharedSession) and the units
/// of work it hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the shared session. Server timestamps are requested under
    /// this name, and unit-of-work names derive from it.
    pub name: String,
    /// Keep a unit of work open after a successful commit.
    pub resume_after_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            resume_after_commit: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn resume_after_commit(mut self, value: bool) -> Self {
        self.resume_after_commit = value;
        self
    }

    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::config(ConfigErrorKind::Invalid, format!("session config: {e}"))
        })?;
        if config.name.is_empty() {
            return Err(Error::config(
                ConfigErrorKind::Invalid,
                "session name must not be empty",
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builder() {
        let config = SessionConfig::new().name("orders").resume_after_commit(true);
        assert_eq!(config.name, "orders");
        assert!(config.resume_after_commit);
        assert!(!SessionConfig::default().resume_after_commit);
    }

    #[test]
    fn test_from_json_str() {
        let config = SessionConfig::from_json_str(r#"{"name": "billing"}"#).unwrap();
        assert_eq!(config.name, "billing");
        assert!(!config.resume_after_commit);

        assert!(SessionConfig::from_json_str(r#"{"name": ""}"#).is_err());
        assert!(SessionConfig::from_json_str("not json").is_err());
    }
}
