//! Change tracking and dirty detection for units of work.
//!
//! A working copy's columns are snapshotted as JSON when it enters the unit
//! of work and again after every successful merge. At commit the current
//! columns are compared against the snapshot, and only changed columns are
//! written.

use keel_core::{EntityKey, Result, Row};
use std::collections::HashMap;
use std::time::Instant;

/// Column state of one working copy at a point in time.
#[derive(Debug)]
pub struct ObjectSnapshot {
    columns: serde_json::Map<String, serde_json::Value>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    fn from_row(row: &Row) -> Result<Self> {
        let mut columns = serde_json::Map::new();
        for (name, value) in row.iter() {
            columns.insert(name.to_string(), serde_json::to_value(value)?);
        }
        Ok(Self {
            columns,
            taken_at: Instant::now(),
        })
    }

    pub fn column(&self, name: &str) -> Option<&serde_json::Value> {
        self.columns.get(name)
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Snapshots of the working copies of one unit of work.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityKey, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (or retake) the snapshot of `key`.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn snapshot(&mut self, key: EntityKey, row: &Row) -> Result<()> {
        let snapshot = ObjectSnapshot::from_row(row)?;
        tracing::trace!(columns = snapshot.columns.len(), "Taking object snapshot");
        self.snapshots.insert(key, snapshot);
        Ok(())
    }

    /// Has `row` changed since the snapshot of `key`? Objects without a
    /// snapshot count as dirty.
    pub fn is_dirty(&self, key: &EntityKey, row: &Row) -> Result<bool> {
        Ok(!self.changed_columns(key, row)?.is_empty())
    }

    /// Columns of `row` whose value differs from the snapshot of `key`.
    /// Without a snapshot every column is reported.
    #[tracing::instrument(level = "debug", skip(self, row))]
    pub fn changed_columns(&self, key: &EntityKey, row: &Row) -> Result<Vec<String>> {
        let Some(snapshot) = self.snapshots.get(key) else {
            tracing::debug!("No snapshot - all columns considered changed");
            return Ok(row.iter().map(|(name, _)| name.to_string()).collect());
        };

        let mut changed = Vec::new();
        for (name, value) in row.iter() {
            let current = serde_json::to_value(value)?;
            if snapshot.columns.get(name) != Some(&current) {
                changed.push(name.to_string());
            }
        }
        tracing::debug!(changed = ?changed, "Detected changed columns");
        Ok(changed)
    }

    pub fn has_snapshot(&self, key: &EntityKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn get_snapshot(&self, key: &EntityKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    pub fn clear(&mut self, key: &EntityKey) {
        self.snapshots.remove(key);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Value;

    fn key() -> EntityKey {
        EntityKey::new("heroes", vec![Value::BigInt(1)])
    }

    fn hero_row(name: &str, age: Option<i32>) -> Row {
        Row::from_pairs([
            ("id", Value::BigInt(1)),
            ("name", Value::from(name)),
            ("age", age.map_or(Value::Null, Value::Int)),
        ])
    }

    #[test]
    fn test_snapshot_and_clean_object() {
        let mut tracker = ChangeTracker::new();
        let row = hero_row("Spider-Man", Some(25));
        tracker.snapshot(key(), &row).unwrap();

        assert!(tracker.has_snapshot(&key()));
        assert!(!tracker.is_dirty(&key(), &row).unwrap());
        assert_eq!(
            tracker.get_snapshot(&key()).unwrap().column("name"),
            Some(&serde_json::to_value(Value::from("Spider-Man")).unwrap())
        );
    }

    #[test]
    fn test_changed_columns() {
        let mut tracker = ChangeTracker::new();
        tracker
            .snapshot(key(), &hero_row("Spider-Man", Some(25)))
            .unwrap();

        let edited = hero_row("Peter Parker", None);
        assert!(tracker.is_dirty(&key(), &edited).unwrap());
        assert_eq!(
            tracker.changed_columns(&key(), &edited).unwrap(),
            vec!["name".to_string(), "age".to_string()]
        );
    }

    #[test]
    fn test_no_snapshot_reports_every_column() {
        let tracker = ChangeTracker::new();
        let row = hero_row("Storm", None);
        assert!(tracker.is_dirty(&key(), &row).unwrap());
        assert_eq!(tracker.changed_columns(&key(), &row).unwrap().len(), 3);
    }

    #[test]
    fn test_clear() {
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(key(), &hero_row("a", None)).unwrap();
        tracker.clear(&key());
        assert!(tracker.is_empty());

        tracker.snapshot(key(), &hero_row("a", None)).unwrap();
        tracker.clear_all();
        assert_eq!(tracker.len(), 0);
    }
}
