//! Storage trait definitions for the masher
//!
//! These traits define the two persistence abstractions the orchestrator needs:
//! - `PushStore`: Push records with their append-only phase history
//! - `LockStore`: Per-repository exclusive locks with visible ownership
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::{Build, RepoKey, Update};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Push identity and phases
// ---------------------------------------------------------------------------

/// Unique identifier for a push
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PushId(pub String);

impl PushId {
    /// Generate a new random PushId
    pub fn new() -> Self {
        PushId(uuid::Uuid::new_v4().to_string())
    }

    /// First eight characters, used in directory names and logs.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PushId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PushId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline phases in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requested,
    Locked,
    BuildsMoved,
    Composing,
    MetadataInjected,
    SanityChecked,
    Published,
    MirrorConfirmed,
    Notified,
    Completed,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::Requested,
        Phase::Locked,
        Phase::BuildsMoved,
        Phase::Composing,
        Phase::MetadataInjected,
        Phase::SanityChecked,
        Phase::Published,
        Phase::MirrorConfirmed,
        Phase::Notified,
        Phase::Completed,
    ];

    /// The phase that must follow this one, if any.
    pub fn next(&self) -> Option<Phase> {
        let idx = Phase::ALL.iter().position(|p| p == self)?;
        Phase::ALL.get(idx + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requested => "requested",
            Phase::Locked => "locked",
            Phase::BuildsMoved => "builds_moved",
            Phase::Composing => "composing",
            Phase::MetadataInjected => "metadata_injected",
            Phase::SanityChecked => "sanity_checked",
            Phase::Published => "published",
            Phase::MirrorConfirmed => "mirror_confirmed",
            Phase::Notified => "notified",
            Phase::Completed => "completed",
        }
    }

    /// Whether the public repository has already changed by the time this
    /// phase runs.
    pub fn is_post_publish(&self) -> bool {
        *self >= Phase::Published
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRecordKind {
    Transition,
    ForcedUnlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Append-only audit entry for one phase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub kind: PhaseRecordKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: PhaseOutcome,
    /// Number of attempts the phase took (1 = no retries).
    pub attempts: u32,
    /// Artifact references such as `compose_path`.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl PhaseRecord {
    pub fn succeeded(
        phase: Phase,
        started_at: DateTime<Utc>,
        attempts: u32,
        artifacts: BTreeMap<String, String>,
    ) -> Self {
        Self {
            phase,
            kind: PhaseRecordKind::Transition,
            started_at,
            finished_at: Utc::now(),
            outcome: PhaseOutcome::Succeeded,
            attempts,
            artifacts,
        }
    }

    pub fn failed(
        phase: Phase,
        started_at: DateTime<Utc>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            kind: PhaseRecordKind::Transition,
            started_at,
            finished_at: Utc::now(),
            outcome: PhaseOutcome::Failed {
                reason: reason.into(),
            },
            attempts,
            artifacts: BTreeMap::new(),
        }
    }

    /// Operator override releasing a lock held by the push.
    pub fn forced_unlock(phase: Phase, operator: &str) -> Self {
        let now = Utc::now();
        let mut artifacts = BTreeMap::new();
        artifacts.insert("operator".to_string(), operator.to_string());
        Self {
            phase,
            kind: PhaseRecordKind::ForcedUnlock,
            started_at: now,
            finished_at: now,
            outcome: PhaseOutcome::Succeeded,
            attempts: 1,
            artifacts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == PhaseRecordKind::Transition && self.outcome == PhaseOutcome::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Push records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PushOutcome {
    InProgress,
    Completed,
    Failed { phase: Phase, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaveatKind {
    PlanningConflict,
    MirrorTimeout,
    NotificationDelivery,
    PostPublish,
}

/// A non-fatal problem attached to a push for operators to review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    pub kind: CaveatKind,
    pub message: String,
}

impl Caveat {
    pub fn new(kind: CaveatKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Full push record.
///
/// `phase` is the last phase with a successful transition record; a resumed
/// pipeline re-enters at `phase.next()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRecord {
    pub push_id: PushId,
    pub repo: RepoKey,
    /// Planned membership, ordered by update id.
    pub updates: Vec<Update>,
    pub phase: Phase,
    pub outcome: PushOutcome,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    #[serde(default)]
    pub phase_records: Vec<PhaseRecord>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PushRecord {
    pub fn new(push_id: PushId, repo: RepoKey, updates: Vec<Update>) -> Self {
        Self {
            push_id,
            repo,
            updates,
            phase: Phase::Requested,
            outcome: PushOutcome::InProgress,
            caveats: Vec::new(),
            phase_records: Vec::new(),
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, PushOutcome::InProgress)
    }

    /// All builds in the push, in membership order.
    pub fn builds(&self) -> impl Iterator<Item = &Build> {
        self.updates.iter().flat_map(|u| u.builds.iter())
    }

    /// The phase the pipeline will run next, or `None` when terminal.
    pub fn next_phase(&self) -> Option<Phase> {
        if self.is_terminal() {
            return None;
        }
        self.phase.next()
    }

    /// Most recent value of an artifact recorded by a successful phase.
    pub fn artifact(&self, key: &str) -> Option<&str> {
        self.phase_records
            .iter()
            .rev()
            .filter(|r| r.is_success())
            .find_map(|r| r.artifacts.get(key))
            .map(String::as_str)
    }

    /// Append a successful record and advance `phase`. The record must be
    /// for the phase immediately after the current one.
    pub fn advance(&mut self, record: PhaseRecord) -> StorageResult<()> {
        let expected = self.next_phase();
        if !record.is_success() || expected != Some(record.phase) {
            return Err(StorageError::InvalidTransition {
                push_id: self.push_id.to_string(),
                from: self.phase.to_string(),
                to: record.phase.to_string(),
            });
        }
        self.phase = record.phase;
        self.phase_records.push(record);
        if self.phase == Phase::Completed {
            self.outcome = PushOutcome::Completed;
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Append a failure record and make the push terminal.
    pub fn fail(&mut self, record: PhaseRecord, reason: impl Into<String>) {
        let phase = record.phase;
        self.phase_records.push(record);
        self.outcome = PushOutcome::Failed {
            phase,
            reason: reason.into(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn add_caveat(&mut self, caveat: Caveat) {
        self.caveats.push(caveat);
    }

    /// Check that `updated` is a legal successor of this stored record:
    /// same push, stored record not terminal, phase history only appended.
    pub fn check_successor(&self, updated: &PushRecord) -> StorageResult<()> {
        if self.push_id != updated.push_id {
            return Err(StorageError::PhaseHistoryRewrite {
                push_id: self.push_id.to_string(),
                reason: format!("push id changed to {}", updated.push_id),
            });
        }
        if self.is_terminal() {
            return Err(StorageError::ImmutablePush {
                push_id: self.push_id.to_string(),
            });
        }
        if updated.phase_records.len() < self.phase_records.len()
            || updated.phase_records[..self.phase_records.len()] != self.phase_records[..]
        {
            return Err(StorageError::PhaseHistoryRewrite {
                push_id: self.push_id.to_string(),
                reason: "existing phase records were modified or removed".to_string(),
            });
        }
        Ok(())
    }
}

/// Filter for listing pushes.
#[derive(Debug, Clone, Default)]
pub struct PushFilter {
    pub repo: Option<RepoKey>,
    /// Only pushes that are not yet terminal.
    pub active_only: bool,
}

impl PushFilter {
    pub fn active() -> Self {
        Self {
            repo: None,
            active_only: true,
        }
    }

    pub fn matches(&self, record: &PushRecord) -> bool {
        if self.active_only && record.is_terminal() {
            return false;
        }
        match &self.repo {
            Some(repo) => &record.repo == repo,
            None => true,
        }
    }
}

/// Push persistence.
///
/// Guarantees:
/// - A push transitions: in-progress → completed | failed (terminal).
/// - Terminal pushes are immutable and never deleted.
/// - Phase records are append-only.
#[async_trait]
pub trait PushStore: Send + Sync {
    /// Persist a new push. Fails with `DuplicatePush` if the id exists.
    async fn create_push(&self, record: &PushRecord) -> StorageResult<()>;

    /// Replace the stored record with `record`, enforcing
    /// [`PushRecord::check_successor`] atomically with the write. A stored
    /// cancellation flag is kept even if `record` was loaded before it was set.
    async fn save_push(&self, record: &PushRecord) -> StorageResult<()>;

    /// Retrieve a push by id. Returns `PushNotFound` if absent.
    async fn get_push(&self, push_id: &PushId) -> StorageResult<PushRecord>;

    /// List pushes matching the filter, oldest first.
    async fn list_pushes(&self, filter: &PushFilter) -> StorageResult<Vec<PushRecord>>;

    /// Flag a push for cancellation at its next phase boundary. Only the flag
    /// changes; the phase history is left alone.
    /// Returns `false` when the push is already terminal.
    async fn request_cancel(&self, push_id: &PushId) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// LockStore: per-repository mutual exclusion
// ---------------------------------------------------------------------------

/// Current owner of a repository lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub repo: RepoKey,
    pub push_id: PushId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired(LockRecord),
    HeldBy(LockRecord),
}

/// Exclusive per-repository locks.
///
/// Semantics:
/// - At most one push holds a given repo key at a time.
/// - `try_acquire` never blocks; a conflict reports the current holder.
/// - Re-acquiring by the current holder succeeds without change.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_acquire(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<LockAcquire>;

    /// Release the lock if (and only if) `push_id` holds it.
    async fn release(&self, repo: &RepoKey, push_id: &PushId) -> StorageResult<bool>;

    /// Operator override: release regardless of holder.
    async fn force_release(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>>;

    async fn holder(&self, repo: &RepoKey) -> StorageResult<Option<LockRecord>>;

    async fn list_locks(&self) -> StorageResult<Vec<LockRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestType;

    fn push() -> PushRecord {
        PushRecord::new(
            PushId::new(),
            RepoKey::new("F17", RequestType::Stable),
            Vec::new(),
        )
    }

    #[test]
    fn test_phase_order_is_strict() {
        assert_eq!(Phase::Requested.next(), Some(Phase::Locked));
        assert_eq!(Phase::SanityChecked.next(), Some(Phase::Published));
        assert_eq!(Phase::Completed.next(), None);
        assert!(Phase::Composing < Phase::Published);
        assert!(Phase::Published.is_post_publish());
        assert!(!Phase::SanityChecked.is_post_publish());
    }

    #[test]
    fn test_advance_rejects_skipping() {
        let mut p = push();
        let ok = PhaseRecord::succeeded(Phase::Locked, Utc::now(), 1, BTreeMap::new());
        p.advance(ok).unwrap();
        assert_eq!(p.phase, Phase::Locked);

        let skip = PhaseRecord::succeeded(Phase::Composing, Utc::now(), 1, BTreeMap::new());
        let err = p.advance(skip).unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
        assert_eq!(p.phase_records.len(), 1);
    }

    #[test]
    fn test_fail_makes_terminal() {
        let mut p = push();
        p.fail(
            PhaseRecord::failed(Phase::Locked, Utc::now(), 1, "boom"),
            "boom",
        );
        assert!(p.is_terminal());
        assert_eq!(p.next_phase(), None);
        assert!(matches!(
            p.outcome,
            PushOutcome::Failed {
                phase: Phase::Locked,
                ..
            }
        ));
    }

    #[test]
    fn test_artifact_returns_latest_success() {
        let mut p = push();
        let mut a = BTreeMap::new();
        a.insert("compose_path".to_string(), "/a".to_string());
        p.phase = Phase::BuildsMoved;
        p.advance(PhaseRecord::succeeded(Phase::Composing, Utc::now(), 1, a))
            .unwrap();
        assert_eq!(p.artifact("compose_path"), Some("/a"));
        assert_eq!(p.artifact("missing"), None);
    }

    #[test]
    fn test_check_successor_detects_rewrite() {
        let mut stored = push();
        stored
            .advance(PhaseRecord::succeeded(
                Phase::Locked,
                Utc::now(),
                1,
                BTreeMap::new(),
            ))
            .unwrap();

        let mut rewritten = stored.clone();
        rewritten.phase_records.clear();
        assert!(matches!(
            stored.check_successor(&rewritten),
            Err(StorageError::PhaseHistoryRewrite { .. })
        ));

        let mut appended = stored.clone();
        appended
            .advance(PhaseRecord::succeeded(
                Phase::BuildsMoved,
                Utc::now(),
                1,
                BTreeMap::new(),
            ))
            .unwrap();
        assert!(stored.check_successor(&appended).is_ok());
    }
}
