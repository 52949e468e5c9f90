//! In-memory collaborators (testing and local demo runs).
//!
//! Every fake records what it was asked to do and can be told to fail, so
//! tests can assert on side effects without any external system.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use masher_state::{Comment, Nvr, PushId, RepoKey, RequestType, Update, UpdateStatus};

use crate::collab::update_store::UpdateExport;
use crate::collab::{
    BugTracker, BuildSystem, BusMessage, CollabError, CollabResult, Mail, Mailer, MessageBus,
    MirrorStatus, Topic, UpdateStore,
};
use crate::compose::{sha256_hex, INDEX_FILE, REPODATA_DIR};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected(service: &'static str) -> CollabError {
    CollabError::Request {
        service,
        reason: "injected failure".to_string(),
    }
}

/// Decrement a failure budget; true while failures remain.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// MemoryBuildSystem
// ---------------------------------------------------------------------------

/// Build system holding a tag set per build. Overrides are builds carrying
/// the release's override tag.
#[derive(Debug, Default)]
pub struct MemoryBuildSystem {
    tags: Mutex<HashMap<Nvr, BTreeSet<String>>>,
    calls: Mutex<Vec<String>>,
    failures: AtomicU32,
}

impl MemoryBuildSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a build with a tag.
    pub fn with_tag(self, nvr: &str, tag: &str) -> Self {
        if let Ok(nvr) = Nvr::parse(nvr) {
            guard(&self.tags).entry(nvr).or_default().insert(tag.to_string());
        }
        self
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn tags_of(&self, nvr: &str) -> Vec<String> {
        let Ok(nvr) = Nvr::parse(nvr) else {
            return Vec::new();
        };
        guard(&self.tags)
            .get(&nvr)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mutating calls in the order they were made.
    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    fn check(&self) -> CollabResult<()> {
        if take_failure(&self.failures) {
            return Err(injected("koji"));
        }
        Ok(())
    }
}

#[async_trait]
impl BuildSystem for MemoryBuildSystem {
    async fn build_tags(&self, nvr: &Nvr) -> CollabResult<Vec<String>> {
        self.check()?;
        Ok(guard(&self.tags)
            .get(nvr)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn move_build(&self, nvr: &Nvr, from_tag: &str, to_tag: &str) -> CollabResult<()> {
        self.check()?;
        let mut tags = guard(&self.tags);
        let set = tags.entry(nvr.clone()).or_default();
        if !set.remove(from_tag) {
            return Err(CollabError::Rejected {
                service: "koji",
                reason: format!("{nvr} is not tagged {from_tag}"),
            });
        }
        set.insert(to_tag.to_string());
        guard(&self.calls).push(format!("move {nvr} {from_tag} {to_tag}"));
        Ok(())
    }

    async fn tag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()> {
        self.check()?;
        guard(&self.tags)
            .entry(nvr.clone())
            .or_default()
            .insert(tag.to_string());
        guard(&self.calls).push(format!("tag {nvr} {tag}"));
        Ok(())
    }

    async fn untag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()> {
        self.check()?;
        let removed = guard(&self.tags)
            .get_mut(nvr)
            .map(|set| set.remove(tag))
            .unwrap_or(false);
        if !removed {
            return Err(CollabError::Rejected {
                service: "koji",
                reason: format!("{nvr} is not tagged {tag}"),
            });
        }
        guard(&self.calls).push(format!("untag {nvr} {tag}"));
        Ok(())
    }

    async fn list_overrides(&self, override_tag: &str) -> CollabResult<Vec<Nvr>> {
        self.check()?;
        let mut out: Vec<Nvr> = guard(&self.tags)
            .iter()
            .filter(|(_, tags)| tags.contains(override_tag))
            .map(|(nvr, _)| nvr.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemoryBugTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BugCall {
    Close { bug_id: u64, comment: String },
    Comment { bug_id: u64, text: String },
    Title { bug_id: u64, title: String },
}

#[derive(Debug, Default)]
pub struct MemoryBugTracker {
    calls: Mutex<Vec<BugCall>>,
    failing: AtomicBool,
}

impl MemoryBugTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BugCall> {
        guard(&self.calls).clone()
    }

    fn record(&self, call: BugCall) -> CollabResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollabError::Rejected {
                service: "bugzilla",
                reason: "injected failure".to_string(),
            });
        }
        guard(&self.calls).push(call);
        Ok(())
    }
}

#[async_trait]
impl BugTracker for MemoryBugTracker {
    async fn close(&self, bug_id: u64, comment: &str) -> CollabResult<()> {
        self.record(BugCall::Close {
            bug_id,
            comment: comment.to_string(),
        })
    }

    async fn comment(&self, bug_id: u64, text: &str) -> CollabResult<()> {
        self.record(BugCall::Comment {
            bug_id,
            text: text.to_string(),
        })
    }

    async fn update_title(&self, bug_id: u64, title: &str) -> CollabResult<()> {
        self.record(BugCall::Title {
            bug_id,
            title: title.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryUpdateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryUpdateStore {
    export: Mutex<UpdateExport>,
    failing_writes: AtomicBool,
}

impl MemoryUpdateStore {
    pub fn new(updates: Vec<Update>) -> Self {
        Self {
            export: Mutex::new(UpdateExport { updates }),
            failing_writes: AtomicBool::new(false),
        }
    }

    /// Make every mutating call fail with a rejection.
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    pub fn snapshot(&self, id: &str) -> Option<Update> {
        guard(&self.export).get(id).ok().cloned()
    }

    fn write<F>(&self, f: F) -> CollabResult<()>
    where
        F: FnOnce(&mut UpdateExport) -> CollabResult<()>,
    {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(CollabError::Rejected {
                service: "update-store",
                reason: "injected failure".to_string(),
            });
        }
        f(&mut guard(&self.export))
    }
}

#[async_trait]
impl UpdateStore for MemoryUpdateStore {
    async fn eligible_updates(&self, request: RequestType) -> CollabResult<Vec<Update>> {
        Ok(guard(&self.export).eligible(request))
    }

    async fn get_update(&self, id: &str) -> CollabResult<Update> {
        guard(&self.export).get(id).cloned()
    }

    async fn mark_staged(&self, id: &str, push_id: &PushId) -> CollabResult<()> {
        self.write(|e| {
            e.get_mut(id)?.staged_in = Some(push_id.to_string());
            Ok(())
        })
    }

    async fn set_status(&self, id: &str, status: UpdateStatus) -> CollabResult<()> {
        self.write(|e| e.set_status(id, status))
    }

    async fn add_comment(&self, id: &str, comment: Comment) -> CollabResult<()> {
        self.write(|e| {
            e.get_mut(id)?.comments.push(comment);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Mirrors
// ---------------------------------------------------------------------------

/// Mirror that serves whatever is currently published under `publish_root`,
/// i.e. propagation is instantaneous.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    publish_root: PathBuf,
}

impl LocalMirror {
    pub fn new(publish_root: impl Into<PathBuf>) -> Self {
        Self {
            publish_root: publish_root.into(),
        }
    }
}

#[async_trait]
impl MirrorStatus for LocalMirror {
    async fn index_digest(&self, repo: &RepoKey) -> CollabResult<Option<String>> {
        let path = self
            .publish_root
            .join(repo.to_string())
            .join(REPODATA_DIR)
            .join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Mirror that never picks up new content.
#[derive(Debug, Default)]
pub struct StaleMirror {
    polls: AtomicU32,
}

impl StaleMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MirrorStatus for StaleMirror {
    async fn index_digest(&self, _repo: &RepoKey) -> CollabResult<Option<String>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Bus and mail
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<BusMessage>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        guard(&self.messages).clone()
    }

    pub fn topics(&self) -> Vec<Topic> {
        guard(&self.messages).iter().map(|m| m.topic).collect()
    }

    pub fn count(&self, topic: Topic) -> usize {
        guard(&self.messages)
            .iter()
            .filter(|m| m.topic == topic)
            .count()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, message: &BusMessage) -> CollabResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected("bus"));
        }
        guard(&self.messages).push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Mail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Mail> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &Mail) -> CollabResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected("mail"));
        }
        guard(&self.sent).push(mail.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_system_moves_and_lists_overrides() {
        let koji = MemoryBuildSystem::new()
            .with_tag("a-1.0-1.fc17", "f17-updates-testing")
            .with_tag("a-0.9-1.fc17", "f17-override");
        let nvr = Nvr::parse("a-1.0-1.fc17").unwrap();

        koji.move_build(&nvr, "f17-updates-testing", "f17-updates")
            .await
            .unwrap();
        assert_eq!(koji.tags_of("a-1.0-1.fc17"), vec!["f17-updates"]);
        assert!(koji
            .move_build(&nvr, "f17-updates-testing", "f17-updates")
            .await
            .is_err());

        let overrides = koji.list_overrides("f17-override").await.unwrap();
        assert_eq!(overrides, vec![Nvr::parse("a-0.9-1.fc17").unwrap()]);
    }

    #[tokio::test]
    async fn build_system_failure_budget() {
        let koji = MemoryBuildSystem::new();
        koji.fail_next(2);
        let nvr = Nvr::parse("a-1.0-1").unwrap();
        assert!(koji.build_tags(&nvr).await.is_err());
        assert!(koji.build_tags(&nvr).await.is_err());
        assert!(koji.build_tags(&nvr).await.is_ok());
    }

    #[tokio::test]
    async fn local_mirror_reports_missing_index_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::new(dir.path());
        let repo = RepoKey::new("F17", RequestType::Stable);
        assert_eq!(mirror.index_digest(&repo).await.unwrap(), None);

        let repodata = dir.path().join("f17-updates").join(REPODATA_DIR);
        std::fs::create_dir_all(&repodata).unwrap();
        std::fs::write(repodata.join(INDEX_FILE), b"{}").unwrap();
        assert_eq!(
            mirror.index_digest(&repo).await.unwrap(),
            Some(sha256_hex(b"{}"))
        );
    }
}
