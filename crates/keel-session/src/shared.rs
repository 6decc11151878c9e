//! The shared session: process-wide cache of originals.
//!
//! Every entity read through a [`SharedSession`] is cached once, keyed by
//! [`EntityKey`]. Units of work never edit these originals directly: they
//! clone them into working copies and merge the clones back after a
//! successful commit.

use crate::config::SessionConfig;
use crate::descriptor::{EntityDescriptor, OriginalResolver};
use crate::identity_map::{IdentityMap, ManagedObject};
use crate::unit_of_work::UnitOfWork;
use keel_core::{
    ColumnGuard, ColumnUpdate, Datastore, Entity, EntityKey, ErasedEntity, LoadContext,
    LockMarker, Managed, Result, Row, SessionChain, Value,
};
use keel_locking::WriteLockCache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared cache of originals over one datastore.
pub struct SharedSession {
    config: SessionConfig,
    datastore: Arc<dyn Datastore>,
    cache: RwLock<IdentityMap>,
    /// Markers of kinds whose policy stores them in the cache.
    markers: RwLock<HashMap<EntityKey, LockMarker>>,
    descriptors: RwLock<HashMap<String, Arc<EntityDescriptor>>>,
    next_unit: AtomicU64,
}

impl SharedSession {
    pub fn new(datastore: Arc<dyn Datastore>) -> Arc<Self> {
        Self::with_config(datastore, SessionConfig::default())
    }

    pub fn with_config(datastore: Arc<dyn Datastore>, config: SessionConfig) -> Arc<Self> {
        tracing::debug!(session = %config.name, datastore = datastore.name(), "Creating shared session");
        Arc::new(Self {
            config,
            datastore,
            cache: RwLock::new(IdentityMap::new()),
            markers: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            next_unit: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn load_context(&self) -> LoadContext {
        LoadContext::new(Arc::clone(&self.datastore))
    }

    // ==================== Descriptors ====================

    /// Register (or replace) the descriptor of its kind.
    pub fn register_descriptor(&self, descriptor: EntityDescriptor) {
        tracing::debug!(kind = descriptor.kind(), "Registering descriptor");
        self.descriptors
            .write()
            .insert(descriptor.kind().to_string(), Arc::new(descriptor));
    }

    pub fn descriptor(&self, kind: &str) -> Option<Arc<EntityDescriptor>> {
        self.descriptors.read().get(kind).map(Arc::clone)
    }

    pub fn descriptors(&self) -> Vec<Arc<EntityDescriptor>> {
        self.descriptors.read().values().map(Arc::clone).collect()
    }

    // ==================== Reads ====================

    /// Read an original through the cache.
    ///
    /// A cache miss reads the row from the datastore, builds the entity and
    /// caches it (and, for in-cache lock policies, its marker).
    #[tracing::instrument(level = "debug", skip(self), fields(kind = E::KIND))]
    pub fn read<E: Entity>(&self, pk: &[Value]) -> Result<Option<Managed<E>>> {
        if let Some(cached) = self.cache.read().get::<E>(pk) {
            tracing::trace!("Cache hit");
            return Ok(Some(cached));
        }

        let Some(row) = self.datastore.read_row(E::KIND, pk)? else {
            return Ok(None);
        };
        let entity = E::from_row(&row, &self.load_context())?;
        let key = entity.key();
        let marker = match self.descriptor(E::KIND).as_ref().and_then(|d| d.lock_policy()) {
            Some(policy) => policy.value_to_put_in_cache(&row)?,
            None => None,
        };

        let mut cache = self.cache.write();
        if let Some(raced) = cache.get::<E>(pk) {
            return Ok(Some(raced));
        }
        let managed = cache.insert(entity);
        if let Some(marker) = marker {
            self.markers.write().insert(key, marker);
        }
        tracing::trace!("Cached original");
        Ok(Some(managed))
    }

    /// The cached original, without reading storage.
    pub fn cached<E: Entity>(&self, pk: &[Value]) -> Option<Managed<E>> {
        self.cache.read().get::<E>(pk)
    }

    pub fn is_cached(&self, key: &EntityKey) -> bool {
        self.cache.read().contains(key)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// The columns of the cached original of `key`.
    pub fn cached_row(&self, key: &EntityKey) -> Option<Row> {
        self.cache.read().get_object(key).map(|object| object.row())
    }

    /// The marker the cache holds for `key`: from the original's lock field,
    /// or from the marker store for in-cache policies.
    pub fn cached_marker(&self, key: &EntityKey) -> Result<Option<LockMarker>> {
        let Some(policy) = self
            .descriptor(key.kind())
            .and_then(|d| d.lock_policy().cloned())
        else {
            return Ok(None);
        };
        let Some(row) = self.cached_row(key) else {
            return Ok(None);
        };
        policy.write_lock_value(&row, key, self)
    }

    // ==================== Units of work ====================

    /// Start a unit of work over this cache.
    pub fn acquire_unit_of_work(self: &Arc<Self>) -> Arc<UnitOfWork> {
        let n = self.next_unit.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-uow-{n}", self.config.name);
        tracing::debug!(unit = %name, "Acquiring unit of work");
        UnitOfWork::new(Arc::clone(self), name, self.config.resume_after_commit)
    }

    // ==================== Bulk writes ====================

    /// Update every row of `kind` matching `filter` in one storage
    /// transaction.
    ///
    /// If `kind` is lock-guarded, the policy's update fragment is appended so
    /// the same write bumps every marker. Cached originals of `kind` are
    /// dropped afterwards.
    #[tracing::instrument(level = "debug", skip(self, filter, assignments))]
    pub fn update_all(
        &self,
        kind: &str,
        filter: Option<&ColumnGuard>,
        mut assignments: Vec<(String, ColumnUpdate)>,
    ) -> Result<u64> {
        if let Some(policy) = self.descriptor(kind).and_then(|d| d.lock_policy().cloned()) {
            let fragment = policy.write_lock_update_fragment();
            assignments.retain(|(column, _)| *column != fragment.0);
            assignments.push(fragment);
        }

        let mut tx = self.datastore.begin_transaction()?;
        let updated = match tx.update_all(kind, filter, &assignments) {
            Ok(count) => count,
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "Rollback after failed bulk update failed");
                }
                return Err(e);
            }
        };
        tx.commit()?;

        let evicted = self.invalidate_kind(kind);
        tracing::info!(kind, rows = updated, evicted, "Bulk update committed");
        Ok(updated)
    }

    // ==================== Invalidation ====================

    /// Drop the cached original of `key`. Returns whether one was cached.
    pub fn invalidate(&self, key: &EntityKey) -> bool {
        self.markers.write().remove(key);
        self.cache.write().remove(key)
    }

    /// Drop every cached original of `kind`.
    pub fn invalidate_kind(&self, kind: &str) -> usize {
        self.markers.write().retain(|key, _| key.kind() != kind);
        self.cache.write().remove_kind(kind)
    }

    pub fn clear(&self) {
        self.markers.write().clear();
        self.cache.write().clear();
    }

    // ==================== Merge ====================

    /// Publish `original` as the cached state of its key. An existing
    /// original is overwritten in place so handles to it stay valid.
    pub(crate) fn merge_original(
        &self,
        original: Arc<dyn ManagedObject>,
        cache_marker: Option<LockMarker>,
    ) -> Result<()> {
        let key = original.key();
        {
            let mut cache = self.cache.write();
            match cache.get_object(&key) {
                Some(existing) => existing.overwrite_with(original.as_ref())?,
                None => cache.put_object(original),
            }
        }
        if let Some(marker) = cache_marker {
            self.markers.write().insert(key.clone(), marker);
        }
        tracing::trace!(key = %key, "Merged original into shared cache");
        Ok(())
    }
}

impl WriteLockCache for SharedSession {
    fn write_lock_value(&self, key: &EntityKey) -> Option<LockMarker> {
        self.markers.read().get(key).copied()
    }
}

impl OriginalResolver for SharedSession {
    fn resolve_original(&self, key: &EntityKey) -> Result<Option<ErasedEntity>> {
        if let Some(cached) = self.cache.read().get_erased(key) {
            return Ok(Some(cached));
        }
        match self.descriptor(key.kind()) {
            Some(descriptor) => descriptor.load(self, key),
            None => Ok(None),
        }
    }

    fn descriptor(&self, kind: &str) -> Option<Arc<EntityDescriptor>> {
        SharedSession::descriptor(self, kind)
    }
}

impl SessionChain for SharedSession {
    fn session_name(&self) -> &str {
        &self.config.name
    }

    fn is_unit_of_work(&self) -> bool {
        false
    }

    fn parent_session(&self) -> Option<&dyn SessionChain> {
        None
    }

    fn datastore(&self) -> &dyn Datastore {
        &*self.datastore
    }
}

impl fmt::Debug for SharedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSession")
            .field("name", &self.config.name)
            .field("datastore", &self.datastore.name())
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatastore;
    use keel_locking::{LockValueStorage, OptimisticLockPolicy};

    #[derive(Debug, Clone, PartialEq)]
    struct Team {
        id: i64,
        name: String,
        version: i64,
    }

    impl Entity for Team {
        const KIND: &'static str = "teams";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn primary_key_value(&self) -> Vec<Value> {
            vec![Value::BigInt(self.id)]
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", Value::BigInt(self.id)),
                ("name", Value::from(self.name.as_str())),
                ("version", Value::BigInt(self.version)),
            ]
        }

        fn from_row(row: &Row, _ctx: &LoadContext) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
                version: row.get_named("version")?,
            })
        }

        fn set_column(&mut self, column: &str, value: &Value) -> Result<()> {
            if column == "version" {
                self.version = i64::try_from(value.clone())?;
            }
            Ok(())
        }
    }

    fn session() -> (Arc<MemoryDatastore>, Arc<SharedSession>) {
        let store = Arc::new(MemoryDatastore::new("memory"));
        store.define_table("teams", &["id"]);
        for (id, name) in [(1, "Avengers"), (2, "X-Men")] {
            store
                .seed(
                    "teams",
                    Row::from_pairs([
                        ("id", Value::BigInt(id)),
                        ("name", Value::from(name)),
                        ("version", Value::BigInt(1)),
                    ]),
                )
                .unwrap();
        }
        let shared = SharedSession::new(Arc::clone(&store) as Arc<dyn Datastore>);
        (store, shared)
    }

    #[test]
    fn test_read_caches_original() {
        let (store, shared) = session();
        let first = shared.read::<Team>(&[Value::BigInt(1)]).unwrap().unwrap();
        let second = shared.read::<Team>(&[Value::BigInt(1)]).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.read_stats("teams").reads, 1);
        assert!(shared.read::<Team>(&[Value::BigInt(9)]).unwrap().is_none());
    }

    #[test]
    fn test_in_cache_marker_stored_on_read() {
        let (_store, shared) = session();
        shared.register_descriptor(EntityDescriptor::new::<Team>().with_lock_policy(
            OptimisticLockPolicy::counter("version").with_storage(LockValueStorage::InCache),
        ));
        shared.read::<Team>(&[Value::BigInt(2)]).unwrap();

        let key = EntityKey::new("teams", vec![Value::BigInt(2)]);
        assert_eq!(
            WriteLockCache::write_lock_value(&*shared, &key),
            Some(LockMarker::Counter(1))
        );
        assert_eq!(shared.cached_marker(&key).unwrap(), Some(LockMarker::Counter(1)));
    }

    #[test]
    fn test_update_all_bumps_markers_and_evicts() {
        let (store, shared) = session();
        shared.register_descriptor(
            EntityDescriptor::new::<Team>()
                .with_lock_policy(OptimisticLockPolicy::counter("version")),
        );
        shared.read::<Team>(&[Value::BigInt(1)]).unwrap();

        let updated = shared
            .update_all(
                "teams",
                None,
                vec![("name".to_string(), ColumnUpdate::Value(Value::from("Renamed")))],
            )
            .unwrap();

        assert_eq!(updated, 2);
        assert_eq!(shared.cache_len(), 0);
        let row = store.committed_row("teams", &[Value::BigInt(1)]).unwrap();
        assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));
        assert_eq!(row.get_by_name("name"), Some(&Value::from("Renamed")));
    }

    #[test]
    fn test_resolve_original_reads_through_descriptor() {
        let (store, shared) = session();
        let key = EntityKey::new("teams", vec![Value::BigInt(2)]);
        assert!(shared.resolve_original(&key).unwrap().is_none());

        shared.register_descriptor(EntityDescriptor::new::<Team>());
        assert!(shared.resolve_original(&key).unwrap().is_some());
        assert!(shared.is_cached(&key));
        assert_eq!(store.read_stats("teams").reads, 1);

        assert!(shared.invalidate(&key));
        assert!(!shared.is_cached(&key));
    }

    #[test]
    fn test_session_chain_is_outermost() {
        let (_store, shared) = session();
        assert!(!shared.is_unit_of_work());
        assert!(shared.parent_session().is_none());
        assert_eq!(shared.session_name(), "default");
        assert_eq!(SessionChain::datastore(&*shared).name(), "memory");
    }
}
