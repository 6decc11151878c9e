mod common;

use common::{Account, Customer, Document, account_descriptor, bank_session, bank_store, pk};
use keel::prelude::*;
use keel::{
    ColumnUpdate, CommitState, Datastore, EntityKey, LockMarker, ManualClock, UnitStatus,
    ViolationReason, WriteLockCache,
};

#[test]
fn stale_counter_write_is_rejected_and_cache_keeps_winner() {
    let store = bank_store();
    let shared = bank_session(&store);
    let t1 = shared.acquire_unit_of_work();
    let t2 = shared.acquire_unit_of_work();

    let a1 = t1.read::<Account>(&pk(10)).expect("read").expect("exists");
    let a2 = t2.read::<Account>(&pk(10)).expect("read").expect("exists");
    assert_eq!(a1.read().version, 1);
    assert_eq!(a2.read().version, 1);

    a1.write().balance += 10;
    a2.write().balance -= 10;

    t1.commit().expect("first commit wins");
    let err = t2.commit().expect_err("second commit is stale");

    let violation = err
        .as_concurrency_violation()
        .expect("concurrency violation");
    assert_eq!(violation.reason, ViolationReason::StaleVersion);
    assert_eq!(violation.entity, EntityKey::new("accounts", pk(10)));
    assert_eq!(violation.expected, Some(LockMarker::Counter(1)));
    assert_eq!(violation.found, Some(LockMarker::Counter(2)));
    assert!(!err.is_retryable());

    let cached = shared.cached::<Account>(&pk(10)).expect("cached");
    assert_eq!(cached.read().version, 2);
    assert_eq!(cached.read().balance, 110);
    let row = store.committed_row("accounts", &pk(10)).expect("row");
    assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));
    assert_eq!(row.get_by_name("balance"), Some(&Value::BigInt(110)));
    assert!(!store.is_locked("accounts", &pk(10)));

    // The losing unit stays open with its working copy intact.
    assert_eq!(t2.status(), UnitStatus::Open);
    assert_eq!(t2.commit_manager().state(), CommitState::Failed);
    assert_eq!(a2.read().balance, 90);
}

#[test]
fn guard_mismatch_without_cached_original_reports_row_changed() {
    let store = bank_store();
    let shared = bank_session(&store);
    let t1 = shared.acquire_unit_of_work();
    let t2 = shared.acquire_unit_of_work();

    let a1 = t1.read::<Account>(&pk(11)).expect("read").expect("exists");
    let a2 = t2.read::<Account>(&pk(11)).expect("read").expect("exists");
    a1.write().balance = 1;
    a2.write().balance = 2;
    t1.commit().expect("first commit");

    shared.invalidate(&EntityKey::new("accounts", pk(11)));
    let err = t2.commit().expect_err("guard mismatch");
    let violation = err.as_concurrency_violation().expect("violation");
    assert_eq!(violation.reason, ViolationReason::RowChanged);
    assert_eq!(violation.found, Some(LockMarker::Counter(2)));
    assert_eq!(
        store
            .committed_row("accounts", &pk(11))
            .expect("row")
            .get_by_name("balance"),
        Some(&Value::BigInt(1))
    );
}

#[test]
fn deleted_row_reports_row_missing() {
    let store = bank_store();
    let shared = bank_session(&store);
    let deleter = shared.acquire_unit_of_work();
    let editor = shared.acquire_unit_of_work();

    let edited = editor.read::<Account>(&pk(11)).expect("read").expect("exists");
    assert!(deleter.delete::<Account>(&pk(11)).expect("delete"));
    deleter.commit().expect("delete commits");
    assert!(!shared.is_cached(&EntityKey::new("accounts", pk(11))));

    edited.write().balance = 5;
    let err = editor.commit().expect_err("row is gone");
    let violation = err.as_concurrency_violation().expect("violation");
    assert_eq!(violation.reason, ViolationReason::RowMissing);
    assert_eq!(violation.found, None);
}

#[test]
fn successive_commits_keep_bumping_the_counter() {
    let store = bank_store();
    let shared = bank_session(&store);
    let uow = shared.acquire_unit_of_work();
    let account = uow.read::<Account>(&pk(10)).expect("read").expect("exists");

    for expected_version in 2..=4 {
        account.write().balance += 1;
        let summary = uow.commit_and_resume().expect("commit");
        assert_eq!(summary.updated, 1);
        assert_eq!(account.read().version, expected_version);
    }
    assert_eq!(uow.status(), UnitStatus::Open);
    assert_eq!(
        shared.cached_marker(&EntityKey::new("accounts", pk(10))).expect("marker"),
        Some(LockMarker::Counter(4))
    );

    // Nothing changed: nothing written, no version bump.
    assert_eq!(uow.commit().expect("empty commit").total(), 0);
    assert_eq!(
        store
            .committed_row("accounts", &pk(10))
            .expect("row")
            .get_by_name("version"),
        Some(&Value::BigInt(4))
    );
}

#[test]
fn insert_writes_initial_marker() {
    let store = bank_store();
    let shared = SharedSession::new(Arc::clone(&store) as Arc<dyn Datastore>);
    shared.register_descriptor(EntityDescriptor::new::<Customer>());
    shared.register_descriptor(account_descriptor(
        OptimisticLockPolicy::counter("version").with_initial_value(7),
    ));

    let uow = shared.acquire_unit_of_work();
    let ctx = shared.load_context();
    let account = uow
        .register_new(Account {
            id: 12,
            balance: 0,
            version: 0,
            owner_id: 3,
            owner: ctx.lazy_one::<Customer>(3_i64),
        })
        .expect("register");
    uow.register_new(Customer {
        id: 3,
        name: "Linus".to_string(),
    })
    .expect("register");
    assert_eq!(uow.pending_counts().expect("counts").new, 2);

    let summary = uow.commit().expect("commit");
    assert_eq!(summary.inserted, 2);
    assert_eq!(account.read().version, 7);
    assert_eq!(
        store
            .committed_row("accounts", &pk(12))
            .expect("row")
            .get_by_name("version"),
        Some(&Value::BigInt(7))
    );
    assert_eq!(
        shared
            .cached::<Account>(&pk(12))
            .expect("merged")
            .read()
            .version,
        7
    );
}

#[test]
fn in_cache_markers_live_beside_the_original() {
    let store = bank_store();
    let shared = bank_session(&store);
    shared.register_descriptor(account_descriptor(
        OptimisticLockPolicy::counter("version").with_storage(LockValueStorage::InCache),
    ));
    let key = EntityKey::new("accounts", pk(10));

    let uow = shared.acquire_unit_of_work();
    let account = uow.read::<Account>(&pk(10)).expect("read").expect("exists");
    assert_eq!(
        WriteLockCache::write_lock_value(&*shared, &key),
        Some(LockMarker::Counter(1))
    );

    account.write().balance = 1;
    uow.commit().expect("commit");
    assert_eq!(
        WriteLockCache::write_lock_value(&*shared, &key),
        Some(LockMarker::Counter(2))
    );
    assert_eq!(
        store
            .committed_row("accounts", &pk(10))
            .expect("row")
            .get_by_name("version"),
        Some(&Value::BigInt(2))
    );
    // The object field is left alone; the marker lives in the cache.
    assert_eq!(account.read().version, 1);
}

fn document_store(clock: &Arc<ManualClock>) -> Arc<MemoryDatastore> {
    let store = Arc::new(
        MemoryDatastore::new("docs").with_clock(Arc::clone(clock) as Arc<dyn keel::Clock>),
    );
    store.define_table("documents", &["id"]);
    store
        .seed(
            "documents",
            Row::from_pairs([
                ("id", Value::BigInt(1)),
                ("title", Value::from("Draft")),
                ("updated_at", Value::Timestamp(1_000)),
            ]),
        )
        .expect("seed document");
    store
}

fn local_time_session(
    store: &Arc<MemoryDatastore>,
    clock: &Arc<ManualClock>,
    ties: TieHandling,
) -> Arc<SharedSession> {
    let mut policy = OptimisticLockPolicy::timestamp("updated_at")
        .with_clock(Arc::clone(clock) as Arc<dyn keel::Clock>)
        .with_ties(ties);
    policy.use_local_time();
    let shared = SharedSession::new(Arc::clone(store) as Arc<dyn Datastore>);
    shared.register_descriptor(EntityDescriptor::new::<Document>().with_lock_policy(policy));
    shared
}

#[test]
fn timestamp_tie_is_a_conflict_by_default() {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = document_store(&clock);
    let shared = local_time_session(&store, &clock, TieHandling::Conflict);

    let uow = shared.acquire_unit_of_work();
    let doc = uow.read::<Document>(&pk(1)).expect("read").expect("exists");
    doc.write().title = "Same tick".to_string();

    let err = uow.commit().expect_err("tie");
    let violation = err.as_concurrency_violation().expect("violation");
    assert_eq!(violation.reason, ViolationReason::TimestampTie);
    assert_eq!(violation.expected, Some(LockMarker::Timestamp(1_000)));
    assert_eq!(violation.found, Some(LockMarker::Timestamp(1_000)));

    // Once the clock moves the same unit commits.
    clock.advance(5);
    uow.commit().expect("commit after tick");
    assert_eq!(
        store
            .committed_row("documents", &pk(1))
            .expect("row")
            .get_by_name("updated_at"),
        Some(&Value::Timestamp(1_005))
    );
    assert_eq!(
        shared.cached::<Document>(&pk(1)).expect("cached").read().updated_at,
        1_005
    );
}

#[test]
fn timestamp_tie_passes_when_ignored() {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = document_store(&clock);
    let shared = local_time_session(&store, &clock, TieHandling::Ignore);

    let uow = shared.acquire_unit_of_work();
    let doc = uow.read::<Document>(&pk(1)).expect("read").expect("exists");
    doc.write().title = "Same tick".to_string();
    uow.commit().expect("tie ignored");

    let row = store.committed_row("documents", &pk(1)).expect("row");
    assert_eq!(row.get_by_name("title"), Some(&Value::from("Same tick")));
    assert_eq!(row.get_by_name("updated_at"), Some(&Value::Timestamp(1_000)));
}

#[test]
fn server_time_is_asked_for_the_outermost_session() {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = document_store(&clock);
    let shared = SharedSession::with_config(
        Arc::clone(&store) as Arc<dyn Datastore>,
        SessionConfig::new().name("docs-app"),
    );
    shared.register_descriptor(
        EntityDescriptor::new::<Document>()
            .with_lock_policy(OptimisticLockPolicy::timestamp("updated_at")),
    );

    clock.set(2_000);
    let uow = shared.acquire_unit_of_work();
    let doc = uow.read::<Document>(&pk(1)).expect("read").expect("exists");
    doc.write().title = "Server stamped".to_string();
    uow.commit().expect("commit");

    assert_eq!(store.server_time_requests(), vec!["docs-app".to_string()]);
    assert_eq!(doc.read().updated_at, 2_000);
}

#[test]
fn bulk_update_bumps_markers_and_evicts_originals() {
    let store = bank_store();
    let shared = bank_session(&store);
    let uow = shared.acquire_unit_of_work();
    let stale = uow.read::<Account>(&pk(10)).expect("read").expect("exists");

    let updated = shared
        .update_all(
            "accounts",
            None,
            vec![("balance".to_string(), ColumnUpdate::Value(Value::BigInt(0)))],
        )
        .expect("bulk update");
    assert_eq!(updated, 2);
    assert_eq!(shared.cache_len(), 0);
    for id in [10, 11] {
        let row = store.committed_row("accounts", &pk(id)).expect("row");
        assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));
    }

    // The working copy read before the bulk write is now stale.
    stale.write().balance = 42;
    let err = uow.commit().expect_err("stale after bulk update");
    assert_eq!(
        err.as_concurrency_violation().map(|v| v.reason),
        Some(ViolationReason::RowChanged)
    );
}
