//! SurrealDB-backed `PushStore` and `LockStore` implementations
//!
//! Push records are stored as a serialized document next to a few indexed
//! columns; the lock table relies on a UNIQUE index for exclusivity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::model::{RepoKey, RequestType};
use crate::storage_traits::{
    LockAcquire, LockRecord, LockStore, PushFilter, PushId, PushRecord, PushStore, StorageResult,
};

// ---------------------------------------------------------------------------
// Pushes
// ---------------------------------------------------------------------------

const PUSH_COLUMNS: &str =
    "push_id, repo_key, active, cancel_requested, history_len, created_at, document";

/// Row layout of the `pushes` table.
///
/// `cancel_requested` lives in its own column so that a cancel never has to
/// rewrite the document, and a document written from an older copy cannot
/// clear it. `history_len` is the number of phase records in `document` and
/// doubles as the row version for guarded writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbPushRecord {
    push_id: String,
    repo_key: String,
    active: bool,
    #[serde(default)]
    cancel_requested: bool,
    #[serde(default)]
    history_len: u64,
    created_at: SurrealDatetime,
    document: String,
}

impl DbPushRecord {
    fn from_record(record: &PushRecord) -> StorageResult<Self> {
        Ok(Self {
            push_id: record.push_id.0.clone(),
            repo_key: record.repo.to_string(),
            active: !record.is_terminal(),
            cancel_requested: record.cancel_requested,
            history_len: record.phase_records.len() as u64,
            created_at: SurrealDatetime::from(record.created_at),
            document: serde_json::to_string(record)?,
        })
    }

    fn into_record(self) -> StorageResult<PushRecord> {
        let mut record: PushRecord = serde_json::from_str(&self.document)?;
        record.cancel_requested |= self.cancel_requested;
        Ok(record)
    }
}

/// SurrealDB-backed implementation of [`PushStore`].
#[derive(Clone)]
pub struct SurrealPushStore {
    db: Surreal<Any>,
}

impl SurrealPushStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    async fn fetch(&self, push_id: &str) -> StorageResult<Option<PushRecord>> {
        let mut result = self
            .db
            .query(format!("SELECT {PUSH_COLUMNS} FROM pushes WHERE push_id = $id"))
            .bind(("id", push_id.to_string()))
            .await?;
        let rows: Vec<DbPushRecord> = result.take(0)?;
        rows.into_iter().next().map(DbPushRecord::into_record).transpose()
    }

    /// Replace the document only if the row is still active and still has
    /// `expected_len` phase records. Returns `false` when another writer got
    /// there first.
    async fn write_guarded(&self, record: &PushRecord, expected_len: usize) -> StorageResult<bool> {
        let row = DbPushRecord::from_record(record)?;
        let mut result = self
            .db
            .query(
                "UPDATE pushes SET document = $doc, active = $active, history_len = $len \
                 WHERE push_id = $id AND active = true AND history_len = $expected \
                 RETURN AFTER",
            )
            .bind(("doc", row.document))
            .bind(("active", row.active))
            .bind(("len", row.history_len))
            .bind(("expected", expected_len as u64))
            .bind(("id", row.push_id))
            .await?;
        let updated: Vec<DbPushRecord> = result.take(0)?;
        Ok(!updated.is_empty())
    }
}

#[async_trait]
impl PushStore for SurrealPushStore {
    #[instrument(skip(self, record), fields(push_id = %record.push_id, repo = %record.repo))]
    async fn create_push(&self, record: &PushRecord) -> StorageResult<()> {
        if self.fetch(&record.push_id.0).await?.is_some() {
            return Err(StorageError::DuplicatePush {
                push_id: record.push_id.0.clone(),
            });
        }
        let row = DbPushRecord::from_record(record)?;
        let created: Option<DbPushRecord> = self.db.create("pushes").content(row).await?;
        if created.is_none() {
            return Err(StorageError::Backend(
                "failed to create push record".to_string(),
            ));
        }
        debug!("push created");
        Ok(())
    }

    #[instrument(skip(self, record), fields(push_id = %record.push_id, phase = %record.phase))]
    async fn save_push(&self, record: &PushRecord) -> StorageResult<()> {
        let missing = || StorageError::PushNotFound {
            push_id: record.push_id.0.clone(),
        };
        let stored = self.fetch(&record.push_id.0).await?.ok_or_else(missing)?;
        stored.check_successor(record)?;
        if self.write_guarded(record, stored.phase_records.len()).await? {
            return Ok(());
        }

        // The row changed between the read and the guarded write.
        let current = self.fetch(&record.push_id.0).await?.ok_or_else(missing)?;
        warn!("push modified concurrently, write rejected");
        if current.is_terminal() {
            return Err(StorageError::ImmutablePush {
                push_id: record.push_id.0.clone(),
            });
        }
        Err(StorageError::PhaseHistoryRewrite {
            push_id: record.push_id.0.clone(),
            reason: format!(
                "stored history grew to {} records while writing",
                current.phase_records.len()
            ),
        })
    }

    async fn get_push(&self, push_id: &PushId) -> StorageResult<PushRecord> {
        self.fetch(&push_id.0)
            .await?
            .ok_or_else(|| StorageError::PushNotFound {
                push_id: push_id.0.clone(),
            })
    }

    async fn list_pushes(&self, filter: &PushFilter) -> StorageResult<Vec<PushRecord>> {
        let mut result = match &filter.repo {
            Some(repo) => {
                self.db
                    .query(format!(
                        "SELECT {PUSH_COLUMNS} FROM pushes WHERE repo_key = $repo ORDER BY created_at"
                    ))
                    .bind(("repo", repo.to_string()))
                    .await?
            }
            None => {
                self.db
                    .query(format!("SELECT {PUSH_COLUMNS} FROM pushes ORDER BY created_at"))
                    .await?
            }
        };
        let rows: Vec<DbPushRecord> = result.take(0)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, push_id: &PushId) -> StorageResult<bool> {
        let mut result = self
            .db
            .query(
                "UPDATE pushes SET cancel_requested = true \
                 WHERE push_id = $id AND active = true RETURN AFTER",
            )
            .bind(("id", push_id.0.clone()))
            .await?;
        let updated: Vec<DbPushRecord> = result.take(0)?;
        if !updated.is_empty() {
            return Ok(true);
        }
        match self.fetch(&push_id.0).await? {
            Some(_) => Ok(false),
            None => Err(StorageError::PushNotFound {
                push_id: push_id.0.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MasherDb;
    use crate::storage_traits::{Phase, PhaseRecord};
    use std::collections::BTreeMap;

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

    #[tokio::test]
    async fn guarded_write_rejects_stale_version() {
        let db = MasherDb::in_memory().await.unwrap();
        let store = db.push_store();
        let push = PushRecord::new(
            PushId::new(),
            RepoKey::new("F17", RequestType::Stable),
            Vec::new(),
        );
        store.create_push(&push).await.unwrap();

        // Another writer appended a record after our copy was read.
        let ahead = locked(push.clone());
        assert!(store.write_guarded(&ahead, 0).await.unwrap());
        assert!(!store.write_guarded(&ahead, 0).await.unwrap());

        let stored = store.get_push(&push.push_id).await.unwrap();
        assert_eq!(stored.phase_records.len(), 1);
    }

    #[tokio::test]
    async fn guarded_write_never_revives_terminal_push() {
        let db = MasherDb::in_memory().await.unwrap();
        let store = db.push_store();
        let push = locked(PushRecord::new(
            PushId::new(),
            RepoKey::new("F17", RequestType::Testing),
            Vec::new(),
        ));
        store.create_push(&push).await.unwrap();

        let mut failed = push.clone();
        failed.fail(
            PhaseRecord::failed(Phase::BuildsMoved, Utc::now(), 0, "forced"),
            "forced",
        );
        store.save_push(&failed).await.unwrap();

        // A pipeline write prepared from the pre-failure copy.
        let mut stale = push.clone();
        stale
            .advance(PhaseRecord::succeeded(
                Phase::BuildsMoved,
                Utc::now(),
                1,
                BTreeMap::new(),
            ))
            .unwrap();
        assert!(!store.write_guarded(&stale, 1).await.unwrap());
        assert!(store.get_push(&push.push_id).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn cancel_does_not_touch_document() {
        let db = MasherDb::in_memory().await.unwrap();
        let store = db.push_store();
        let push = PushRecord::new(
            PushId::new(),
            RepoKey::new("F17", RequestType::Stable),
            Vec::new(),
        );
        store.create_push(&push).await.unwrap();

        assert!(store.request_cancel(&push.push_id).await.unwrap());
        // Written from a copy loaded before the cancel.
        store.save_push(&locked(push.clone())).await.unwrap();

        let stored = store.get_push(&push.push_id).await.unwrap();
        assert!(stored.cancel_requested);
        assert_eq!(stored.phase, Phase::Locked);
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbLockRecord {
    repo_key: String,
    release: String,
    request: String,
    push_id: String,
    acquired_at: SurrealDatetime,
}

impl DbLockRecord {
    fn into_lock_record(self) -> StorageResult<LockRecord> {
        let request: RequestType = self.request.parse()?;
        Ok(LockRecord {
            repo: RepoKey::new(&self.release, request),
            push_id: PushId(self.push_id),
            acquired_at: DateTime::<Utc>::from(self.acquired_at),
        })
    }
}

/// SurrealDB-backed implementation of [`LockStore`].
#[derive(Clone)]
pub struct SurrealLockStore {
    db: Surreal<Any>,
}

impl SurrealLockStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    fn rows_into_records(rows: Vec<DbLockRecord>) -> StorageResult<Vec<LockRecord>> {
        rows.into_iter().map(DbLockRecord::into_lock_record).collect()
    }
}

#[async_trait]
impl LockStore for SurrealLockStore {
    #[instrument(skip_all, fields(repo = %repo, push_id = %push_id))]
    async fn try_acquire(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<LockAcquire> {
        if let Some(held) = self.holder(repo).await? {
            if &held.push_id == push_id {
                return Ok(LockAcquire::Acquired(held));
            }
            return Ok(LockAcquire::HeldBy(held));
        }

        let row = DbLockRecord {
            repo_key: repo.to_string(),
            release: repo.release.clone(),
            request: repo.request.as_str().to_string(),
            push_id: push_id.0.clone(),
            acquired_at: SurrealDatetime::from(Utc::now()),
        };
        let created: Result<Option<DbLockRecord>, surrealdb::Error> =
            self.db.create("repo_locks").content(row).await;

        match created {
            Ok(Some(row)) => Ok(LockAcquire::Acquired(row.into_lock_record()?)),
            Ok(None) => Err(StorageError::Backend(
                "failed to create lock record".to_string(),
            )),
            Err(e) => {
                // Lost a race against another acquirer: the unique index
                // rejected our row, so report whoever holds it now.
                warn!(error = %e, "lock insert rejected");
                match self.holder(repo).await? {
                    Some(held) if &held.push_id == push_id => Ok(LockAcquire::Acquired(held)),
                    Some(held) => Ok(LockAcquire::HeldBy(held)),
                    None => Err(StorageError::Backend(e.to_string())),
                }
            }
        }
    }

    #[instrument(skip_all, fields(repo = %repo, push_id = %push_id))]
    async fn release(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<bool> {
        let mut result = self
            .db
            .query("DELETE repo_locks WHERE repo_key = $key AND push_id = $push RETURN BEFORE")
            .bind(("key", repo.to_string()))
            .bind(("push", push_id.0.clone()))
            .await?;
        let removed: Vec<DbLockRecord> = result.take(0)?;
        Ok(!removed.is_empty())
    }

    #[instrument(skip_all, fields(repo = %repo))]
    async fn force_release(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>> {
        let mut result = self
            .db
            .query("DELETE repo_locks WHERE repo_key = $key RETURN BEFORE")
            .bind(("key", repo.to_string()))
            .await?;
        let removed: Vec<DbLockRecord> = result.take(0)?;
        removed
            .into_iter()
            .next()
            .map(DbLockRecord::into_lock_record)
            .transpose()
    }

    async fn holder(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>> {
        let mut result = self
            .db
            .query("SELECT repo_key, release, request, push_id, acquired_at FROM repo_locks WHERE repo_key = $key")
            .bind(("key", repo.to_string()))
            .await?;
        let rows: Vec<DbLockRecord> = result.take(0)?;
        rows.into_iter()
            .next()
            .map(DbLockRecord::into_lock_record)
            .transpose()
    }

    async fn list_locks(&self) -> StorageResult<Vec<LockRecord>> {
        let mut result = self
            .db
            .query("SELECT repo_key, release, request, push_id, acquired_at FROM repo_locks ORDER BY repo_key")
            .await?;
        let rows: Vec<DbLockRecord> = result.take(0)?;
        Self::rows_into_records(rows)
    }
}
