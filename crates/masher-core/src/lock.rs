//! RepoLock: per-repository mutual exclusion with visible ownership.

use std::sync::Arc;

use chrono::Utc;
use masher_state::{
    LockAcquire, LockRecord, LockStore, Phase, PhaseRecord, PushId, PushRecord, PushStore,
    RepoKey, StorageError,
};
use tracing::{info, instrument, warn};

use crate::error::{MashError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Result of an operator override.
#[derive(Debug, Clone)]
pub struct ForcedUnlock {
    pub lock: LockRecord,
    /// The holding push after the override, if it still exists.
    pub push: Option<PushRecord>,
}

/// Per-repo lock over a [`LockStore`]. Acquisition never blocks: a held lock
/// is reported as [`MashError::LockConflict`].
#[derive(Clone)]
pub struct RepoLock {
    locks: Arc<dyn LockStore>,
    pushes: Arc<dyn PushStore>,
}

impl RepoLock {
    pub fn new(locks: Arc<dyn LockStore>, pushes: Arc<dyn PushStore>) -> Self {
        Self { locks, pushes }
    }

    #[instrument(skip_all, fields(repo = %repo, push_id = %push_id))]
    pub async fn acquire(&self, repo: &RepoKey, push_id: &PushId) -> Result<LockRecord> {
        match self.locks.try_acquire(repo, push_id).await? {
            LockAcquire::Acquired(record) => Ok(record),
            LockAcquire::HeldBy(holder) => {
                METRICS.inc_lock_conflicts();
                obs::emit_lock_conflict(&repo.to_string(), push_id.as_str(), holder.push_id.as_str());
                Err(MashError::LockConflict {
                    repo: repo.to_string(),
                    holder: holder.push_id.to_string(),
                })
            }
        }
    }

    /// Release if `push_id` holds the lock. Returns whether it did.
    pub async fn release(&self, repo: &RepoKey, push_id: &PushId) -> Result<bool> {
        let released = self.locks.release(repo, push_id).await?;
        if released {
            info!(repo = %repo, push_id = %push_id, "lock released");
        }
        Ok(released)
    }

    pub async fn holder(&self, repo: &RepoKey) -> Result<Option<LockRecord>> {
        Ok(self.locks.holder(repo).await?)
    }

    pub async fn list(&self) -> Result<Vec<LockRecord>> {
        Ok(self.locks.list_locks().await?)
    }

    /// Operator override: release whatever holds `repo`, record a
    /// `forced_unlock` entry on the holding push and fail it if it is still
    /// running.
    #[instrument(skip_all, fields(repo = %repo, operator = %operator))]
    pub async fn force_unlock(&self, repo: &RepoKey, operator: &str) -> Result<Option<ForcedUnlock>> {
        let Some(lock) = self.locks.force_release(repo).await? else {
            info!("repository was not locked");
            return Ok(None);
        };
        obs::emit_forced_unlock(&repo.to_string(), lock.push_id.as_str(), operator);

        // The pipeline may append a record between our read and write; retry
        // on a lost race.
        for _ in 0..3 {
            let mut push = match self.pushes.get_push(&lock.push_id).await {
                Ok(push) => push,
                Err(StorageError::PushNotFound { .. }) => {
                    warn!(push_id = %lock.push_id, "lock was held by an unknown push");
                    return Ok(Some(ForcedUnlock { lock, push: None }));
                }
                Err(e) => return Err(e.into()),
            };
            if push.is_terminal() {
                info!(push_id = %push.push_id, "holding push already terminal");
                return Ok(Some(ForcedUnlock {
                    lock,
                    push: Some(push),
                }));
            }

            let phase = push.next_phase().unwrap_or(Phase::Completed);
            let reason = format!("lock forcibly released by {operator}");
            push.phase_records
                .push(PhaseRecord::forced_unlock(phase, operator));
            push.fail(PhaseRecord::failed(phase, Utc::now(), 0, &reason), reason);

            match self.pushes.save_push(&push).await {
                Ok(()) => {
                    obs::emit_push_failed(push.push_id.as_str(), phase.as_str(), "forced unlock");
                    return Ok(Some(ForcedUnlock {
                        lock,
                        push: Some(push),
                    }));
                }
                Err(StorageError::PhaseHistoryRewrite { .. } | StorageError::ImmutablePush { .. }) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MashError::Storage(StorageError::Backend(format!(
            "could not record forced unlock on push {}",
            lock.push_id
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masher_state::fakes::{MemoryLockStore, MemoryPushStore};
    use masher_state::{PhaseRecordKind, PushOutcome, RequestType};
    use std::collections::BTreeMap;

    fn setup() -> (RepoLock, Arc<MemoryPushStore>) {
        let pushes = Arc::new(MemoryPushStore::new());
        let lock = RepoLock::new(Arc::new(MemoryLockStore::new()), pushes.clone());
        (lock, pushes)
    }

    fn repo() -> RepoKey {
        RepoKey::new("F17", RequestType::Stable)
    }

    #[tokio::test]
    async fn conflict_reports_holder() {
        let (lock, _) = setup();
        let a = PushId::new();
        lock.acquire(&repo(), &a).await.unwrap();
        match lock.acquire(&repo(), &PushId::new()).await {
            Err(MashError::LockConflict { holder, .. }) => assert_eq!(holder, a.to_string()),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_unlock_fails_running_push() {
        let (lock, pushes) = setup();
        let mut push = PushRecord::new(PushId::new(), repo(), Vec::new());
        lock.acquire(&repo(), &push.push_id).await.unwrap();
        push.advance(PhaseRecord::succeeded(
            Phase::Locked,
            Utc::now(),
            1,
            BTreeMap::new(),
        ))
        .unwrap();
        pushes.create_push(&push).await.unwrap();

        let forced = lock.force_unlock(&repo(), "ops-bob").await.unwrap().unwrap();
        assert_eq!(forced.lock.push_id, push.push_id);
        assert!(lock.holder(&repo()).await.unwrap().is_none());

        let stored = pushes.get_push(&push.push_id).await.unwrap();
        match &stored.outcome {
            PushOutcome::Failed { phase, reason } => {
                assert_eq!(*phase, Phase::BuildsMoved);
                assert!(reason.contains("ops-bob"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(stored
            .phase_records
            .iter()
            .any(|r| r.kind == PhaseRecordKind::ForcedUnlock));
    }

    #[tokio::test]
    async fn force_unlock_on_free_repo_is_noop() {
        let (lock, _) = setup();
        assert!(lock.force_unlock(&repo(), "ops").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_unlock_tolerates_unknown_holder() {
        let (lock, _) = setup();
        lock.acquire(&repo(), &PushId::new()).await.unwrap();
        let forced = lock.force_unlock(&repo(), "ops").await.unwrap().unwrap();
        assert!(forced.push.is_none());
    }
}
