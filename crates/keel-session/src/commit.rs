//! Commit ordering and commit state.
//!
//! Pending writes are ordered so that referenced rows exist before the rows
//! pointing at them:
//! - INSERT parent-first
//! - UPDATE in any order
//! - DELETE child-first
//!
//! The [`CommitManager`] records whether a unit of work is in the middle of
//! writing; lazy references consult it to decide how to read.

use keel_core::{EntityKey, Error, Result, Row, Value};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A pending storage write of one working copy.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Insert {
        key: EntityKey,
        row: Row,
    },
    /// Update of the changed columns only.
    Update {
        key: EntityKey,
        set_columns: Vec<(String, Value)>,
    },
    Delete {
        key: EntityKey,
    },
}

impl PendingOp {
    pub fn key(&self) -> &EntityKey {
        match self {
            PendingOp::Insert { key, .. }
            | PendingOp::Update { key, .. }
            | PendingOp::Delete { key } => key,
        }
    }

    pub fn kind(&self) -> &str {
        self.key().kind()
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Orders pending writes by the dependencies between entity kinds.
#[derive(Debug, Default)]
pub struct CommitOrderer {
    /// Kind -> kinds it references.
    dependencies: HashMap<String, Vec<String>>,
}

impl CommitOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_kind(&mut self, kind: &str, depends_on: &[&str]) {
        self.dependencies.insert(
            kind.to_string(),
            depends_on.iter().map(|k| (*k).to_string()).collect(),
        );
    }

    fn dependency_count(&self, kind: &str) -> usize {
        self.dependencies.get(kind).map_or(0, Vec::len)
    }

    /// Fail if the registered dependencies contain a cycle; no write order
    /// would satisfy them.
    pub fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            kind: &'a str,
            deps: &'a HashMap<String, Vec<String>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(kind) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(Error::invalid_state(format!(
                        "dependency cycle through {kind}"
                    )));
                }
                None => {}
            }
            marks.insert(kind, Mark::Visiting);
            for next in deps.get(kind).into_iter().flatten() {
                visit(next, deps, marks)?;
            }
            marks.insert(kind, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for kind in self.dependencies.keys() {
            visit(kind, &self.dependencies, &mut marks)?;
        }
        Ok(())
    }

    /// Split `ops` into a plan: inserts parent-first, deletes child-first.
    /// Writes of equal rank keep their registration order.
    pub fn order(&self, ops: Vec<PendingOp>) -> CommitPlan {
        let mut plan = CommitPlan::default();
        for op in ops {
            match op {
                PendingOp::Insert { .. } => plan.inserts.push(op),
                PendingOp::Update { .. } => plan.updates.push(op),
                PendingOp::Delete { .. } => plan.deletes.push(op),
            }
        }

        plan.inserts
            .sort_by_key(|op| self.dependency_count(op.kind()));
        plan.deletes
            .sort_by_key(|op| std::cmp::Reverse(self.dependency_count(op.kind())));
        plan
    }
}

/// Ordered pending writes of one commit.
#[derive(Debug, Default)]
pub struct CommitPlan {
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (any order).
    pub updates: Vec<PendingOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Every operation in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts
            .iter()
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
    }
}

/// Row counts written by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CommitSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Where a unit of work is in its commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitState {
    #[default]
    Idle,
    /// Writing to storage or merging into the shared cache.
    Active,
    Committed,
    Failed,
}

/// Tracks the commit state of one unit of work.
#[derive(Debug, Default)]
pub struct CommitManager {
    state: Mutex<CommitState>,
}

impl CommitManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CommitState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == CommitState::Active
    }

    /// Enter the active state. A commit cannot start while another is
    /// running.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == CommitState::Active {
            return Err(Error::invalid_state("commit already in progress"));
        }
        *state = CommitState::Active;
        Ok(())
    }

    pub fn complete(&self) {
        *self.state.lock() = CommitState::Committed;
    }

    pub fn fail(&self) {
        *self.state.lock() = CommitState::Failed;
    }

    /// Return to idle so the unit of work can commit again.
    pub fn reset(&self) {
        *self.state.lock() = CommitState::Idle;
    }
}
