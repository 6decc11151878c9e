//! Session contracts consulted by lazy references and locking policies.

use crate::Result;
use crate::datastore::{Datastore, LockMode};
use crate::entity::{EntityKey, ErasedEntity};
use crate::producer::LoadContext;
use crate::row::Row;
use crate::value::Value;

/// A chain of sessions, innermost first.
///
/// Units of work are nested inside a shared session; the server clock is
/// always asked on behalf of the outermost non-nested session.
pub trait SessionChain: Send + Sync {
    fn session_name(&self) -> &str;

    fn is_unit_of_work(&self) -> bool;

    fn parent_session(&self) -> Option<&dyn SessionChain>;

    fn datastore(&self) -> &dyn Datastore;
}

/// Walk up from `session` to the first session that is not a unit of work.
pub fn outermost_session(session: &dyn SessionChain) -> &dyn SessionChain {
    let mut current = session;
    while current.is_unit_of_work() {
        match current.parent_session() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

/// The transaction a lazy reference is being triggered for.
pub trait TransactionScope: Send + Sync {
    /// Is the commit machinery currently writing this transaction?
    fn is_commit_active(&self) -> bool;

    /// Was the storage transaction opened before commit?
    fn was_transaction_begun_prematurely(&self) -> bool;

    /// Open the storage transaction now if it is not open yet.
    fn begin_early_transaction(&self) -> Result<()>;

    /// The transaction's working copy for `key`, if it holds one.
    fn working_copy(&self, key: &EntityKey) -> Option<ErasedEntity>;

    /// Read a row through the transaction's open storage transaction, or
    /// directly when none is open and no lock is requested.
    fn read_row_in_transaction(&self, kind: &str, pk: &[Value], lock: LockMode)
    -> Result<Option<Row>>;

    fn read_rows_in_transaction(
        &self,
        kind: &str,
        column: &str,
        value: &Value,
        lock: LockMode,
    ) -> Result<Vec<Row>>;

    /// Context for building entities read inside this transaction.
    fn load_context(&self) -> LoadContext;
}
