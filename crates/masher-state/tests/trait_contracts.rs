//! Trait contract tests for PushStore and LockStore.
//!
//! Every contract runs against the in-memory fakes and the SurrealDB stores
//! (on `mem://`). Any conforming implementation must pass these.

use std::collections::BTreeMap;

use chrono::Utc;
use masher_state::fakes::{MemoryLockStore, MemoryPushStore};
use masher_state::*;

fn repo() -> RepoKey {
    RepoKey::new("F17", RequestType::Stable)
}

fn sample_push() -> PushRecord {
    PushRecord::new(PushId::new(), repo(), Vec::new())
}

fn locked(mut push: PushRecord) -> PushRecord {
    push.advance(PhaseRecord::succeeded(
        Phase::Locked,
        Utc::now(),
        1,
        BTreeMap::new(),
    ))
    .unwrap();
    push
}

async fn surreal() -> MasherDb {
    MasherDb::in_memory().await.expect("in-memory surreal")
}

// ===========================================================================
// PushStore contracts
// ===========================================================================

async fn push_create_and_get(store: &dyn PushStore) {
    let push = sample_push();
    store.create_push(&push).await.unwrap();
    let loaded = store.get_push(&push.push_id).await.unwrap();
    assert_eq!(loaded, push);
}

async fn push_duplicate_rejected(store: &dyn PushStore) {
    let push = sample_push();
    store.create_push(&push).await.unwrap();
    let err = store.create_push(&push).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicatePush { .. }));
}

async fn push_get_missing(store: &dyn PushStore) {
    let err = store.get_push(&PushId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::PushNotFound { .. }));
}

async fn push_save_appends_history(store: &dyn PushStore) {
    let push = sample_push();
    store.create_push(&push).await.unwrap();

    let push = locked(push);
    store.save_push(&push).await.unwrap();

    let loaded = store.get_push(&push.push_id).await.unwrap();
    assert_eq!(loaded.phase, Phase::Locked);
    assert_eq!(loaded.phase_records.len(), 1);
}

async fn push_save_rejects_history_rewrite(store: &dyn PushStore) {
    let push = locked(sample_push());
    store.create_push(&push).await.unwrap();

    let mut rewritten = push.clone();
    rewritten.phase_records.clear();
    let err = store.save_push(&rewritten).await.unwrap_err();
    assert!(matches!(err, StorageError::PhaseHistoryRewrite { .. }));
}

async fn push_terminal_is_immutable(store: &dyn PushStore) {
    let mut push = sample_push();
    store.create_push(&push).await.unwrap();

    push.fail(
        PhaseRecord::failed(Phase::Locked, Utc::now(), 1, "boom"),
        "boom",
    );
    store.save_push(&push).await.unwrap();

    push.add_caveat(Caveat::new(CaveatKind::PostPublish, "late"));
    let err = store.save_push(&push).await.unwrap_err();
    assert!(matches!(err, StorageError::ImmutablePush { .. }));

    let loaded = store.get_push(&push.push_id).await.unwrap();
    assert!(loaded.caveats.is_empty());
}

async fn push_list_filters_active(store: &dyn PushStore) {
    let running = sample_push();
    store.create_push(&running).await.unwrap();

    let mut failed = sample_push();
    store.create_push(&failed).await.unwrap();
    failed.fail(
        PhaseRecord::failed(Phase::Locked, Utc::now(), 1, "boom"),
        "boom",
    );
    store.save_push(&failed).await.unwrap();

    let all = store.list_pushes(&PushFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let active = store.list_pushes(&PushFilter::active()).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].push_id, running.push_id);

    let other_repo = PushFilter {
        repo: Some(RepoKey::new("F18", RequestType::Testing)),
        active_only: false,
    };
    assert!(store.list_pushes(&other_repo).await.unwrap().is_empty());
}

async fn push_cancel_flags_only_active(store: &dyn PushStore) {
    let mut push = sample_push();
    store.create_push(&push).await.unwrap();
    assert!(store.request_cancel(&push.push_id).await.unwrap());
    assert!(store.get_push(&push.push_id).await.unwrap().cancel_requested);

    push.cancel_requested = true;
    push.fail(
        PhaseRecord::failed(Phase::Locked, Utc::now(), 1, "cancelled"),
        "cancelled",
    );
    store.save_push(&push).await.unwrap();
    assert!(!store.request_cancel(&push.push_id).await.unwrap());
}

async fn push_cancel_survives_stale_save(store: &dyn PushStore) {
    let push = sample_push();
    store.create_push(&push).await.unwrap();
    // The pipeline holds a copy loaded before the cancel arrives.
    let running = locked(push.clone());
    assert!(store.request_cancel(&push.push_id).await.unwrap());

    store.save_push(&running).await.unwrap();
    let loaded = store.get_push(&push.push_id).await.unwrap();
    assert!(loaded.cancel_requested);
    assert_eq!(loaded.phase_records.len(), 1);
}

async fn push_stale_save_after_failure_rejected(store: &dyn PushStore) {
    let push = locked(sample_push());
    store.create_push(&push).await.unwrap();

    let mut failed = push.clone();
    failed.fail(
        PhaseRecord::failed(Phase::BuildsMoved, Utc::now(), 0, "lock forcibly released"),
        "lock forcibly released",
    );
    store.save_push(&failed).await.unwrap();

    let mut stale = push.clone();
    stale
        .advance(PhaseRecord::succeeded(
            Phase::BuildsMoved,
            Utc::now(),
            1,
            BTreeMap::new(),
        ))
        .unwrap();
    let err = store.save_push(&stale).await.unwrap_err();
    assert!(matches!(err, StorageError::ImmutablePush { .. }));
    assert!(store.get_push(&push.push_id).await.unwrap().is_terminal());
}

#[tokio::test]
async fn memory_push_store_contracts() {
    push_create_and_get(&MemoryPushStore::new()).await;
    push_duplicate_rejected(&MemoryPushStore::new()).await;
    push_get_missing(&MemoryPushStore::new()).await;
    push_save_appends_history(&MemoryPushStore::new()).await;
    push_save_rejects_history_rewrite(&MemoryPushStore::new()).await;
    push_terminal_is_immutable(&MemoryPushStore::new()).await;
    push_list_filters_active(&MemoryPushStore::new()).await;
    push_cancel_flags_only_active(&MemoryPushStore::new()).await;
    push_cancel_survives_stale_save(&MemoryPushStore::new()).await;
    push_stale_save_after_failure_rejected(&MemoryPushStore::new()).await;
}

#[tokio::test]
async fn surreal_push_store_contracts() {
    push_create_and_get(&surreal().await.push_store()).await;
    push_duplicate_rejected(&surreal().await.push_store()).await;
    push_get_missing(&surreal().await.push_store()).await;
    push_save_appends_history(&surreal().await.push_store()).await;
    push_save_rejects_history_rewrite(&surreal().await.push_store()).await;
    push_terminal_is_immutable(&surreal().await.push_store()).await;
    push_list_filters_active(&surreal().await.push_store()).await;
    push_cancel_flags_only_active(&surreal().await.push_store()).await;
    push_cancel_survives_stale_save(&surreal().await.push_store()).await;
    push_stale_save_after_failure_rejected(&surreal().await.push_store()).await;
}

// ===========================================================================
// LockStore contracts
// ===========================================================================

async fn lock_is_exclusive(store: &dyn LockStore) {
    let a = PushId::new();
    let b = PushId::new();

    assert!(matches!(
        store.try_acquire(&repo(), &a).await.unwrap(),
        LockAcquire::Acquired(_)
    ));
    match store.try_acquire(&repo(), &b).await.unwrap() {
        LockAcquire::HeldBy(held) => assert_eq!(held.push_id, a),
        other => panic!("expected HeldBy, got {other:?}"),
    }
}

async fn lock_reacquire_by_holder(store: &dyn LockStore) {
    let a = PushId::new();
    store.try_acquire(&repo(), &a).await.unwrap();
    match store.try_acquire(&repo(), &a).await.unwrap() {
        LockAcquire::Acquired(held) => assert_eq!(held.push_id, a),
        other => panic!("expected Acquired, got {other:?}"),
    }
    assert_eq!(store.list_locks().await.unwrap().len(), 1);
}

async fn lock_release_only_by_holder(store: &dyn LockStore) {
    let a = PushId::new();
    let b = PushId::new();
    store.try_acquire(&repo(), &a).await.unwrap();

    assert!(!store.release(&repo(), &b).await.unwrap());
    assert!(store.holder(&repo()).await.unwrap().is_some());

    assert!(store.release(&repo(), &a).await.unwrap());
    assert!(store.holder(&repo()).await.unwrap().is_none());

    assert!(matches!(
        store.try_acquire(&repo(), &b).await.unwrap(),
        LockAcquire::Acquired(_)
    ));
}

async fn lock_keys_are_independent(store: &dyn LockStore) {
    let testing = RepoKey::new("F17", RequestType::Testing);
    store.try_acquire(&repo(), &PushId::new()).await.unwrap();
    assert!(matches!(
        store.try_acquire(&testing, &PushId::new()).await.unwrap(),
        LockAcquire::Acquired(_)
    ));

    let locks = store.list_locks().await.unwrap();
    assert_eq!(locks.len(), 2);
}

async fn lock_force_release(store: &dyn LockStore) {
    let a = PushId::new();
    store.try_acquire(&repo(), &a).await.unwrap();

    let removed = store.force_release(&repo()).await.unwrap();
    assert_eq!(removed.map(|r| r.push_id), Some(a));
    assert!(store.holder(&repo()).await.unwrap().is_none());
    assert!(store.force_release(&repo()).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_lock_store_contracts() {
    lock_is_exclusive(&MemoryLockStore::new()).await;
    lock_reacquire_by_holder(&MemoryLockStore::new()).await;
    lock_release_only_by_holder(&MemoryLockStore::new()).await;
    lock_keys_are_independent(&MemoryLockStore::new()).await;
    lock_force_release(&MemoryLockStore::new()).await;
}

#[tokio::test]
async fn surreal_lock_store_contracts() {
    lock_is_exclusive(&surreal().await.lock_store()).await;
    lock_reacquire_by_holder(&surreal().await.lock_store()).await;
    lock_release_only_by_holder(&surreal().await.lock_store()).await;
    lock_keys_are_independent(&surreal().await.lock_store()).await;
    lock_force_release(&surreal().await.lock_store()).await;
}

#[tokio::test]
async fn surreal_lock_unique_index_rejects_second_row() {
    let db = surreal().await;
    let store = db.lock_store();
    let a = PushId::new();
    let b = PushId::new();

    let (repo_a, repo_b) = (repo(), repo());
    let (ra, rb) = tokio::join!(
        store.try_acquire(&repo_a, &a),
        store.try_acquire(&repo_b, &b)
    );
    let acquired = [ra.unwrap(), rb.unwrap()]
        .into_iter()
        .filter(|r| matches!(r, LockAcquire::Acquired(_)))
        .count();
    assert_eq!(acquired, 1);
}
