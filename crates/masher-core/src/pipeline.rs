//! PushPipeline: drives one push through its phases in strict order.
//!
//! The push record in the store is the checkpoint. Before every phase the
//! record is reloaded; a phase only counts once its success record has been
//! saved. A storage error stops the pipeline without failing the push, so it
//! can be resumed later. Any other error before `Published` fails the push
//! and releases the lock. From `Published` on, problems become caveats.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use masher_state::{
    Caveat, CaveatKind, Comment, LockStore, Nvr, Phase, PhaseRecord, PushId, PushRecord,
    PushStore, RequestType, StorageError,
};
use tracing::{debug, info, instrument, warn, Instrument};

use crate::collab::{
    BugTracker, BuildSystem, CollabError, CollabResult, Mailer, MessageBus, MirrorStatus, Topic,
    UpdateStore,
};
use crate::compose::{sha256_hex, ComposeBackend, ComposeError, RepoComposer, RepoIndex};
use crate::config::MasherConfig;
use crate::error::{MashError, Result};
use crate::lock::RepoLock;
use crate::metrics::METRICS;
use crate::mirror::{MirrorWait, MirrorWaiter};
use crate::notify::{MailSettings, NotificationEmitter};
use crate::obs;
use crate::planner::PlannedPush;
use crate::publish::PublishSwitcher;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy};
use crate::sanity::SanityChecker;
use crate::tags::ReleaseTags;
use crate::updateinfo::MetadataInjector;

/// Artifact keys recorded on phase records.
pub const COMPOSE_PATH: &str = "compose_path";
pub const PREVIOUS_COMPOSE: &str = "previous_compose";
pub const INDEX_DIGEST: &str = "index_digest";
pub const UPDATEINFO_SHA256: &str = "updateinfo_sha256";

/// Author of the comments the masher leaves on updates.
pub const SYSTEM_USER: &str = "bodhi";

/// Upper bound on pushes with identical membership.
const MAX_GENERATIONS: u32 = 1024;

/// External systems a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub builds: Arc<dyn BuildSystem>,
    pub bugs: Arc<dyn BugTracker>,
    pub updates: Arc<dyn UpdateStore>,
    /// `None` skips the mirror wait with a caveat.
    pub mirror: Option<Arc<dyn MirrorStatus>>,
    pub bus: Arc<dyn MessageBus>,
    pub mailer: Arc<dyn Mailer>,
}

/// What a successful phase hands back for its record.
#[derive(Debug, Default)]
struct PhaseDone {
    attempts: u32,
    artifacts: BTreeMap<String, String>,
    caveats: Vec<Caveat>,
}

impl PhaseDone {
    fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    fn artifact(mut self, key: &str, value: impl Into<String>) -> Self {
        self.artifacts.insert(key.to_string(), value.into());
        self
    }

    fn caveat(mut self, kind: CaveatKind, message: impl Into<String>) -> Self {
        self.caveats.push(Caveat::new(kind, message));
        self
    }
}

#[derive(Debug)]
struct PhaseFailed {
    error: MashError,
    attempts: u32,
}

impl From<MashError> for PhaseFailed {
    fn from(error: MashError) -> Self {
        Self { error, attempts: 1 }
    }
}

impl From<StorageError> for PhaseFailed {
    fn from(error: StorageError) -> Self {
        MashError::from(error).into()
    }
}

impl From<ComposeError> for PhaseFailed {
    fn from(error: ComposeError) -> Self {
        MashError::from(error).into()
    }
}

impl From<std::io::Error> for PhaseFailed {
    fn from(error: std::io::Error) -> Self {
        MashError::from(error).into()
    }
}

type PhaseResult = std::result::Result<PhaseDone, PhaseFailed>;

/// Override tag changes made while moving builds.
#[derive(Debug, Clone)]
struct OverrideChange {
    topic: Topic,
    nvr: Nvr,
    tag: String,
}

pub struct PushPipeline {
    pushes: Arc<dyn PushStore>,
    lock: RepoLock,
    collab: Collaborators,
    composer: RepoComposer,
    injector: MetadataInjector,
    sanity: SanityChecker,
    switcher: PublishSwitcher,
    mirror: Option<MirrorWaiter>,
    notifier: NotificationEmitter,
    builds_retry: RetryPolicy,
}

impl PushPipeline {
    pub fn new(
        config: &MasherConfig,
        pushes: Arc<dyn PushStore>,
        locks: Arc<dyn LockStore>,
        collab: Collaborators,
        backend: Arc<dyn ComposeBackend>,
    ) -> Self {
        let mirror = collab
            .mirror
            .clone()
            .map(|status| MirrorWaiter::new(status, config.mirror.retry.clone()));
        let notifier = NotificationEmitter::new(
            collab.bus.clone(),
            collab.mailer.clone(),
            config.notify.retry.clone(),
            MailSettings::from(&config.notify),
        );
        Self {
            lock: RepoLock::new(locks, pushes.clone()),
            pushes,
            composer: RepoComposer::new(
                &config.paths.compose_root,
                backend,
                config.compose.retry.clone(),
            ),
            injector: MetadataInjector::new(&config.notify.bug_url_base),
            sanity: SanityChecker::new(),
            switcher: PublishSwitcher::new(&config.paths.publish_root, &config.paths.compose_root),
            mirror,
            notifier,
            builds_retry: config.builds.retry.clone(),
            collab,
        }
    }

    pub fn pushes(&self) -> &Arc<dyn PushStore> {
        &self.pushes
    }

    pub fn lock(&self) -> &RepoLock {
        &self.lock
    }

    pub fn switcher(&self) -> &PublishSwitcher {
        &self.switcher
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Lock the repository, record the push and run it to a terminal state.
    ///
    /// A lock conflict is returned as [`MashError::LockConflict`] and leaves
    /// nothing behind.
    #[instrument(skip_all, fields(repo = %plan.repo))]
    pub async fn start(&self, plan: &PlannedPush) -> Result<PushRecord> {
        let push_id = self.claim_id(plan).await?;
        self.lock.acquire(&plan.repo, &push_id).await?;

        let mut push = PushRecord::new(push_id.clone(), plan.repo.clone(), plan.updates.clone());
        for caveat in &plan.caveats {
            push.add_caveat(caveat.clone());
        }
        let locked = PhaseRecord::succeeded(Phase::Locked, Utc::now(), 1, BTreeMap::new());
        push.advance(locked)?;

        match self.pushes.create_push(&push).await {
            Ok(()) => {}
            // An identical trigger won the race; the lock is that push's.
            Err(StorageError::DuplicatePush { .. }) => {
                METRICS.inc_lock_conflicts();
                return Err(MashError::LockConflict {
                    repo: plan.repo.to_string(),
                    holder: push_id.to_string(),
                });
            }
            Err(e) => {
                if let Err(release) = self.lock.release(&plan.repo, &push_id).await {
                    warn!(error = %release, "could not release lock after failed create");
                }
                return Err(e.into());
            }
        }

        METRICS.inc_pushes_started();
        obs::emit_push_started(push_id.as_str(), &plan.repo.to_string(), push.updates.len());
        if let Err(e) = self.notifier.mash_started(&push).await {
            warn!(error = %e, "mash-started was not delivered");
        }

        self.run(&push_id).await
    }

    /// Pick the id for a planned push: the first generation that has not
    /// been used yet. A live push with the same membership is a conflict.
    async fn claim_id(&self, plan: &PlannedPush) -> Result<PushId> {
        for generation in 0..MAX_GENERATIONS {
            let id = plan.push_id(generation);
            match self.pushes.get_push(&id).await {
                Err(StorageError::PushNotFound { .. }) => return Ok(id),
                Ok(existing) if existing.is_terminal() => continue,
                Ok(existing) => {
                    METRICS.inc_lock_conflicts();
                    let repo = plan.repo.to_string();
                    obs::emit_lock_conflict(&repo, id.as_str(), existing.push_id.as_str());
                    return Err(MashError::LockConflict {
                        repo,
                        holder: existing.push_id.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MashError::PlanningConflict(format!(
            "{MAX_GENERATIONS} earlier pushes of {} had the same membership",
            plan.repo
        )))
    }

    /// Resume a push after a restart: re-verify the lock, then re-enter at
    /// the phase after the last successful one.
    #[instrument(skip_all, fields(push_id = %push_id))]
    pub async fn resume(&self, push_id: &PushId) -> Result<PushRecord> {
        let push = self.pushes.get_push(push_id).await?;
        if push.is_terminal() {
            return Ok(push);
        }

        match self.lock.acquire(&push.repo, push_id).await {
            Ok(_) => {}
            Err(MashError::LockConflict { holder, .. }) if push.phase.is_post_publish() => {
                warn!(%holder, "repository locked by another push; finishing published push anyway");
            }
            Err(MashError::LockConflict { holder, .. }) => {
                let phase = push.next_phase().unwrap_or(Phase::Completed);
                let reason = format!("repository is locked by push {holder}");
                return self.abort(push, phase, 0, Utc::now(), reason).await;
            }
            Err(e) => return Err(e),
        }

        info!(phase = %push.phase, "resuming push");
        self.run(push_id).await
    }

    /// Run phases until the push is terminal or the store fails.
    pub async fn run(&self, push_id: &PushId) -> Result<PushRecord> {
        let push = self.pushes.get_push(push_id).await?;
        let span = obs::push_span(push_id.as_str(), &push.repo.to_string());
        self.drive(push_id).instrument(span).await
    }

    async fn drive(&self, push_id: &PushId) -> Result<PushRecord> {
        let clock = Instant::now();
        loop {
            let mut push = self.pushes.get_push(push_id).await?;
            let Some(next) = push.next_phase() else {
                return Ok(push);
            };

            if push.cancel_requested && !push.phase.is_post_publish() {
                info!(phase = %next, "cancellation honoured");
                return self
                    .abort(push, next, 0, Utc::now(), "cancelled".to_string())
                    .await;
            }

            let started_at = Utc::now();
            let phase_clock = Instant::now();
            debug!(phase = %next, "entering phase");

            let done = match self.execute(&push, next).await {
                Ok(done) => done,
                Err(failed) if failed.error.is_storage() => return Err(failed.error),
                Err(failed) if push.phase.is_post_publish() => {
                    // Publication already happened; record and carry on.
                    warn!(phase = %next, error = %failed.error, "post-publish step failed");
                    PhaseDone {
                        attempts: failed.attempts,
                        ..PhaseDone::default()
                    }
                    .caveat(
                        CaveatKind::PostPublish,
                        format!("{next}: {}", failed.error),
                    )
                }
                Err(failed) => {
                    let reason = failed.error.to_string();
                    return self
                        .abort(push, next, failed.attempts, started_at, reason)
                        .await;
                }
            };

            let attempts = done.attempts.max(1);
            for caveat in done.caveats {
                push.add_caveat(caveat);
            }
            push.advance(PhaseRecord::succeeded(next, started_at, attempts, done.artifacts))?;
            match self.pushes.save_push(&push).await {
                Ok(()) => {}
                Err(StorageError::ImmutablePush { .. }) => {
                    warn!(phase = %next, "push was terminated while the phase ran");
                    return Ok(self.pushes.get_push(push_id).await?);
                }
                Err(e) => return Err(e.into()),
            }
            obs::emit_phase_completed(
                push_id.as_str(),
                next.as_str(),
                attempts,
                phase_clock.elapsed().as_millis() as u64,
            );

            if next == Phase::Completed {
                METRICS.inc_pushes_completed();
                obs::emit_push_finished(
                    push_id.as_str(),
                    true,
                    push.caveats.len(),
                    clock.elapsed().as_millis() as u64,
                );
                return Ok(push);
            }
        }
    }

    /// Fail the push at `phase`, release its lock and announce the outcome.
    async fn abort(
        &self,
        mut push: PushRecord,
        phase: Phase,
        attempts: u32,
        started_at: DateTime<Utc>,
        reason: String,
    ) -> Result<PushRecord> {
        push.fail(
            PhaseRecord::failed(phase, started_at, attempts, reason.clone()),
            reason.clone(),
        );
        match self.pushes.save_push(&push).await {
            Ok(()) => {}
            Err(StorageError::ImmutablePush { .. }) => {
                return Ok(self.pushes.get_push(&push.push_id).await?);
            }
            Err(e) => return Err(e.into()),
        }

        METRICS.inc_pushes_failed();
        obs::emit_push_failed(push.push_id.as_str(), phase.as_str(), &reason);
        if let Err(e) = self.lock.release(&push.repo, &push.push_id).await {
            warn!(error = %e, "could not release lock of failed push");
        }
        if let Err(e) = self.notifier.mash_completed(&push).await {
            warn!(error = %e, "failure event was not delivered");
        }
        obs::emit_push_finished(push.push_id.as_str(), false, push.caveats.len(), 0);
        Ok(push)
    }

    async fn execute(&self, push: &PushRecord, phase: Phase) -> PhaseResult {
        match phase {
            Phase::Requested => Ok(PhaseDone::once()),
            Phase::Locked => {
                self.lock.acquire(&push.repo, &push.push_id).await?;
                Ok(PhaseDone::once())
            }
            Phase::BuildsMoved => self.move_builds(push).await,
            Phase::Composing => self.compose(push).await,
            Phase::MetadataInjected => self.inject_metadata(push).await,
            Phase::SanityChecked => self.check_sanity(push).await,
            Phase::Published => self.publish(push).await,
            Phase::MirrorConfirmed => Ok(self.confirm_mirror(push).await),
            Phase::Notified => Ok(self.notify(push).await),
            Phase::Completed => self.complete(push).await,
        }
    }

    // -----------------------------------------------------------------------
    // BuildsMoved
    // -----------------------------------------------------------------------

    async fn move_builds(&self, push: &PushRecord) -> PhaseResult {
        let tags = ReleaseTags::for_repo(&push.repo);
        let changes = Mutex::new(Vec::new());
        let (tags_ref, changes_ref) = (&tags, &changes);

        let moved = retry_with_backoff(&self.builds_retry, "move builds", move |_| async move {
            self.move_builds_once(push, tags_ref, changes_ref).await
        })
        .await;

        let moved = match moved {
            Ok(done) => done,
            Err(failure) => {
                let attempts = failure.attempts();
                let reason = match failure {
                    RetryFailure::Fatal { error, .. } | RetryFailure::Exhausted { error, .. } => {
                        error.to_string()
                    }
                    other => other.to_string(),
                };
                return Err(PhaseFailed {
                    error: MashError::BuildSystem(reason),
                    attempts,
                });
            }
        };

        self.retitle_security_bugs(push).await;

        let changes = changes.into_inner().unwrap_or_else(PoisonError::into_inner);
        for change in &changes {
            if let Err(e) = self
                .notifier
                .override_event(push, change.topic, &change.nvr.to_string(), &change.tag)
                .await
            {
                warn!(error = %e, "override event was not delivered");
            }
        }

        Ok(PhaseDone {
            attempts: moved.attempts,
            ..PhaseDone::default()
        }
        .artifact("moved_builds", moved.value.to_string())
        .artifact("override_changes", changes.len().to_string()))
    }

    /// One pass over tags, overrides and staged markers. Safe to repeat.
    async fn move_builds_once(
        &self,
        push: &PushRecord,
        tags: &ReleaseTags,
        changes: &Mutex<Vec<OverrideChange>>,
    ) -> CollabResult<usize> {
        let koji = &self.collab.builds;
        let mut moved = 0;

        for build in push.builds() {
            let current = koji.build_tags(&build.nvr).await?;
            let has = |tag: &str| current.iter().any(|t| t == tag);
            if has(tags.source()) {
                koji.move_build(&build.nvr, tags.source(), tags.destination())
                    .await?;
                moved += 1;
            } else if !has(tags.destination()) {
                return Err(CollabError::Rejected {
                    service: "koji",
                    reason: format!(
                        "{} is tagged neither {} nor {}",
                        build.nvr,
                        tags.source(),
                        tags.destination()
                    ),
                });
            }
            if has(tags.pending.as_str()) {
                koji.untag_build(&build.nvr, &tags.pending).await?;
            }
        }

        let pushed: BTreeMap<&str, &Nvr> = push.builds().map(|b| (b.package(), &b.nvr)).collect();
        let record = |topic: Topic, nvr: &Nvr| {
            changes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(OverrideChange {
                    topic,
                    nvr: nvr.clone(),
                    tag: tags.override_tag.clone(),
                });
        };
        for nvr in koji.list_overrides(&tags.override_tag).await? {
            let Some(pushed_nvr) = pushed.get(nvr.name.as_str()).copied() else {
                continue;
            };
            match push.repo.request {
                RequestType::Stable => {
                    koji.untag_build(&nvr, &tags.override_tag).await?;
                    record(Topic::BuildrootOverrideUntag, &nvr);
                }
                RequestType::Testing if nvr != *pushed_nvr => {
                    koji.tag_build(pushed_nvr, &tags.override_tag).await?;
                    record(Topic::BuildrootOverrideTag, pushed_nvr);
                    koji.untag_build(&nvr, &tags.override_tag).await?;
                    record(Topic::BuildrootOverrideUntag, &nvr);
                }
                RequestType::Testing => {}
            }
        }

        for update in &push.updates {
            self.collab
                .updates
                .mark_staged(&update.id, &push.push_id)
                .await?;
        }
        Ok(moved)
    }

    async fn retitle_security_bugs(&self, push: &PushRecord) {
        for bug in push.updates.iter().flat_map(|u| u.bugs.iter()) {
            if !bug.security || bug.title.starts_with("[SECURITY]") {
                continue;
            }
            let title = format!("[SECURITY] {}", bug.title);
            if let Err(e) = self.collab.bugs.update_title(bug.id, &title).await {
                warn!(bug = bug.id, error = %e, "could not retitle security bug");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Composing .. SanityChecked
    // -----------------------------------------------------------------------

    async fn compose(&self, push: &PushRecord) -> PhaseResult {
        let out = self.composer.compose(push).await?;
        Ok(PhaseDone {
            attempts: out.attempts,
            ..PhaseDone::default()
        }
        .artifact(COMPOSE_PATH, out.path.display().to_string()))
    }

    /// The compose tree recorded for the push. If it has disappeared, compose
    /// again and redo every completed step up to `phase` on the new tree;
    /// the new path is returned as an artifact of `phase`.
    async fn tree_for(
        &self,
        push: &PushRecord,
        phase: Phase,
    ) -> std::result::Result<(PathBuf, PhaseDone), PhaseFailed> {
        if let Some(path) = push.artifact(COMPOSE_PATH) {
            let path = PathBuf::from(path);
            if tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                return Ok((path, PhaseDone::once()));
            }
            warn!(path = %path.display(), "compose directory missing, composing again");
        }

        let out = self.composer.compose(push).await?;
        let mut done = PhaseDone {
            attempts: out.attempts,
            ..PhaseDone::default()
        }
        .artifact(COMPOSE_PATH, out.path.display().to_string());

        if phase > Phase::MetadataInjected {
            let entry = self.injector.inject(push, &out.path).await?;
            done = done.artifact(UPDATEINFO_SHA256, entry.sha256);
        }
        if phase > Phase::SanityChecked {
            self.require_sane(push, &out.path).await?;
        }
        Ok((out.path, done))
    }

    async fn inject_metadata(&self, push: &PushRecord) -> PhaseResult {
        let (tree, done) = self.tree_for(push, Phase::MetadataInjected).await?;
        match self.injector.inject(push, &tree).await {
            Ok(entry) => Ok(done.artifact(UPDATEINFO_SHA256, entry.sha256)),
            Err(e) => {
                warn!(error = %e, "metadata injection failed, composing again");
                let out = self.composer.compose(push).await?;
                let entry = self.injector.inject(push, &out.path).await?;
                Ok(PhaseDone {
                    attempts: done.attempts + 1,
                    ..PhaseDone::default()
                }
                .artifact(COMPOSE_PATH, out.path.display().to_string())
                .artifact(UPDATEINFO_SHA256, entry.sha256))
            }
        }
    }

    async fn require_sane(
        &self,
        push: &PushRecord,
        tree: &Path,
    ) -> std::result::Result<usize, PhaseFailed> {
        let report = self.sanity.check(push, tree).await;
        if report.passed {
            return Ok(report.checked_packages);
        }
        Err(MashError::SanityCheckFailure(
            report.reason.unwrap_or_else(|| "unknown problem".to_string()),
        )
        .into())
    }

    async fn check_sanity(&self, push: &PushRecord) -> PhaseResult {
        let (tree, done) = self.tree_for(push, Phase::SanityChecked).await?;
        let checked = self.require_sane(push, &tree).await?;
        Ok(done.artifact("checked_packages", checked.to_string()))
    }

    // -----------------------------------------------------------------------
    // Published and after
    // -----------------------------------------------------------------------

    async fn publish(&self, push: &PushRecord) -> PhaseResult {
        let (tree, mut done) = self.tree_for(push, Phase::Published).await?;
        let index = tokio::fs::read(RepoIndex::path(&tree)).await?;
        let switched = self.switcher.switch(&push.repo, &tree).await?;

        if switched.changed {
            if let Some(previous) = &switched.previous {
                done = done.artifact(PREVIOUS_COMPOSE, previous.display().to_string());
            }
        }
        Ok(done
            .artifact(COMPOSE_PATH, tree.display().to_string())
            .artifact(INDEX_DIGEST, sha256_hex(&index)))
    }

    async fn confirm_mirror(&self, push: &PushRecord) -> PhaseDone {
        let Some(waiter) = &self.mirror else {
            return PhaseDone::once().caveat(
                CaveatKind::MirrorTimeout,
                "no master mirror configured; propagation not confirmed",
            );
        };
        let Some(expected) = push.artifact(INDEX_DIGEST) else {
            return PhaseDone::once().caveat(
                CaveatKind::MirrorTimeout,
                "no published index digest recorded; propagation not confirmed",
            );
        };

        match waiter.wait(&push.repo, expected).await {
            MirrorWait::Confirmed { attempts } => PhaseDone {
                attempts,
                ..PhaseDone::default()
            },
            MirrorWait::TimedOut { attempts, reason } => {
                let timeout = MashError::MirrorTimeout {
                    repo: push.repo.to_string(),
                    attempts,
                };
                PhaseDone {
                    attempts,
                    ..PhaseDone::default()
                }
                .caveat(CaveatKind::MirrorTimeout, format!("{timeout}: {reason}"))
            }
        }
    }

    async fn notify(&self, push: &PushRecord) -> PhaseDone {
        let target = push.repo.request.target_status();
        let mut done = PhaseDone::once();
        let mut processed = Vec::new();

        for update in &push.updates {
            match self.collab.updates.get_update(&update.id).await {
                Ok(current) if current.status == target => {
                    debug!(update = %update.id, "already at {target:?}, skipping");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    done = done.caveat(CaveatKind::PostPublish, format!("{}: {e}", update.id));
                    continue;
                }
            }

            for bug in &update.bugs {
                let result = match push.repo.request {
                    RequestType::Stable => {
                        let comment = format!(
                            "{} has been pushed to the {} stable repository.",
                            update.title, push.repo.release
                        );
                        self.collab.bugs.close(bug.id, &comment).await
                    }
                    RequestType::Testing => {
                        let comment = format!(
                            "{} has been pushed to the {} testing repository.",
                            update.title, push.repo.release
                        );
                        self.collab.bugs.comment(bug.id, &comment).await
                    }
                };
                if let Err(e) = result {
                    done = done.caveat(
                        CaveatKind::PostPublish,
                        format!("{}: bug {}: {e}", update.id, bug.id),
                    );
                }
            }

            let comment = Comment {
                author: SYSTEM_USER.to_string(),
                text: format!("This update has been pushed to {}.", target.as_str()),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.collab.updates.add_comment(&update.id, comment).await {
                done = done.caveat(CaveatKind::PostPublish, format!("{}: comment: {e}", update.id));
            }
            if let Err(e) = self.collab.updates.set_status(&update.id, target).await {
                done = done.caveat(CaveatKind::PostPublish, format!("{}: status: {e}", update.id));
            }
            processed.push(update.clone());
        }

        match push.repo.request {
            RequestType::Stable => {
                for update in &processed {
                    let mail = self.notifier.stable_notice(push, update);
                    if let Err(e) = self.notifier.send(&mail).await {
                        done = done.caveat(CaveatKind::NotificationDelivery, e.to_string());
                    }
                    if let Err(e) = self.notifier.errata_published(push, update).await {
                        done = done.caveat(CaveatKind::NotificationDelivery, e.to_string());
                    }
                }
            }
            RequestType::Testing if !processed.is_empty() => {
                let mail = self.notifier.testing_digest(push, &processed);
                if let Err(e) = self.notifier.send(&mail).await {
                    done = done.caveat(CaveatKind::NotificationDelivery, e.to_string());
                }
            }
            RequestType::Testing => {}
        }

        done.artifact("notified_updates", processed.len().to_string())
    }

    async fn complete(&self, push: &PushRecord) -> PhaseResult {
        self.lock.release(&push.repo, &push.push_id).await?;

        let mut done = PhaseDone::once();
        let mut preview = push.clone();
        preview.advance(PhaseRecord::succeeded(
            Phase::Completed,
            Utc::now(),
            1,
            BTreeMap::new(),
        ))?;
        if let Err(e) = self.notifier.mash_completed(&preview).await {
            done = done.caveat(CaveatKind::NotificationDelivery, e.to_string());
        }
        Ok(done)
    }
}
