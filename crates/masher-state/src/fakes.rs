//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryPushStore` and `MemoryLockStore` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::model::RepoKey;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store mutex poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryPushStore
// ---------------------------------------------------------------------------

/// In-memory push store backed by a `HashMap<push_id, PushRecord>`.
#[derive(Debug, Default)]
pub struct MemoryPushStore {
    pushes: Mutex<HashMap<String, PushRecord>>,
}

impl MemoryPushStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushStore for MemoryPushStore {
    async fn create_push(&self, record: &PushRecord) -> StorageResult<()> {
        let mut pushes = lock(&self.pushes)?;
        if pushes.contains_key(&record.push_id.0) {
            return Err(StorageError::DuplicatePush {
                push_id: record.push_id.0.clone(),
            });
        }
        pushes.insert(record.push_id.0.clone(), record.clone());
        Ok(())
    }

    async fn save_push(&self, record: &PushRecord) -> StorageResult<()> {
        let mut pushes = lock(&self.pushes)?;
        let stored = pushes
            .get_mut(&record.push_id.0)
            .ok_or_else(|| StorageError::PushNotFound {
                push_id: record.push_id.0.clone(),
            })?;
        stored.check_successor(record)?;
        let cancel_requested = stored.cancel_requested;
        *stored = record.clone();
        stored.cancel_requested |= cancel_requested;
        Ok(())
    }

    async fn get_push(&self, push_id: &PushId) -> StorageResult<PushRecord> {
        let pushes = lock(&self.pushes)?;
        pushes
            .get(&push_id.0)
            .cloned()
            .ok_or_else(|| StorageError::PushNotFound {
                push_id: push_id.0.clone(),
            })
    }

    async fn list_pushes(&self, filter: &PushFilter) -> StorageResult<Vec<PushRecord>> {
        let pushes = lock(&self.pushes)?;
        let mut out: Vec<PushRecord> = pushes
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.push_id.cmp(&b.push_id))
        });
        Ok(out)
    }

    async fn request_cancel(&self, push_id: &PushId) -> StorageResult<bool> {
        let mut pushes = lock(&self.pushes)?;
        let stored = pushes
            .get_mut(&push_id.0)
            .ok_or_else(|| StorageError::PushNotFound {
                push_id: push_id.0.clone(),
            })?;
        if stored.is_terminal() {
            return Ok(false);
        }
        stored.cancel_requested = true;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryLockStore
// ---------------------------------------------------------------------------

/// In-memory lock table keyed by the repo key's display form.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<LockAcquire> {
        let mut locks = lock(&self.locks)?;
        let key = repo.to_string();
        if let Some(held) = locks.get(&key) {
            if &held.push_id == push_id {
                return Ok(LockAcquire::Acquired(held.clone()));
            }
            return Ok(LockAcquire::HeldBy(held.clone()));
        }
        let record = LockRecord {
            repo: repo.clone(),
            push_id: push_id.clone(),
            acquired_at: Utc::now(),
        };
        locks.insert(key, record.clone());
        Ok(LockAcquire::Acquired(record))
    }

    async fn release(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<bool> {
        let mut locks = lock(&self.locks)?;
        let key = repo.to_string();
        match locks.get(&key) {
            Some(held) if &held.push_id == push_id => {
                locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>> {
        let mut locks = lock(&self.locks)?;
        Ok(locks.remove(&repo.to_string()))
    }

    async fn holder(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>> {
        let locks = lock(&self.locks)?;
        Ok(locks.get(&repo.to_string()).cloned())
    }

    async fn list_locks(&self) -> StorageResult<Vec<LockRecord>> {
        let locks = lock(&self.locks)?;
        let mut out: Vec<LockRecord> = locks.values().cloned().collect();
        out.sort_by(|a, b| a.repo.cmp(&b.repo));
        Ok(out)
    }
}
