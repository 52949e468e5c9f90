//! Masher: the entry point binaries talk to.
//!
//! Wires config, persistence and collaborators into a [`PushPipeline`] and
//! exposes the trigger and operator operations.

use std::sync::Arc;

use futures::future::join_all;
use masher_state::{
    LockRecord, LockStore, MasherDb, PushFilter, PushId, PushRecord, PushStore, RepoKey,
    StorageError,
};
use tracing::{info, instrument, warn};

use crate::auth::{TriggerAuthorizer, TriggerEvent};
use crate::collab::{
    BugTracker, BugzillaClient, HttpBus, HttpMirrorStatus, JsonUpdateStore, KojiCli,
    LogBugTracker, LogBus, MessageBus, MirrorStatus, SpoolMailer,
};
use crate::compose::{backend_from_config, ComposeBackend};
use crate::config::MasherConfig;
use crate::error::{MashError, Result};
use crate::lock::ForcedUnlock;
use crate::planner::PushPlanner;
use crate::pipeline::{Collaborators, PushPipeline};

/// What happened to one planned push of a trigger.
#[derive(Debug)]
pub enum PushReport {
    /// The push ran; its record says whether it completed or failed.
    Accepted(PushRecord),
    /// Another push holds the repository.
    Rejected { repo: RepoKey, reason: String },
    /// The push could not be started or checkpointed.
    Errored { repo: RepoKey, error: MashError },
}

impl PushReport {
    pub fn repo(&self) -> &RepoKey {
        match self {
            PushReport::Accepted(push) => &push.repo,
            PushReport::Rejected { repo, .. } | PushReport::Errored { repo, .. } => repo,
        }
    }
}

pub struct Masher {
    authorizer: TriggerAuthorizer,
    planner: PushPlanner,
    pipeline: PushPipeline,
}

impl Masher {
    pub fn new(
        config: &MasherConfig,
        pushes: Arc<dyn PushStore>,
        locks: Arc<dyn LockStore>,
        collab: Collaborators,
        backend: Arc<dyn ComposeBackend>,
    ) -> Self {
        Self {
            authorizer: TriggerAuthorizer::from_config(&config.releng),
            planner: PushPlanner::new(collab.updates.clone()),
            pipeline: PushPipeline::new(config, pushes, locks, collab, backend),
        }
    }

    /// Build the production wiring: SurrealDB state, `koji`, Bugzilla, the
    /// JSON update export, HTTP mirror and bus, spool mailer.
    pub async fn from_config(config: &MasherConfig) -> Result<Self> {
        let db = match &config.state.url {
            Some(url) => MasherDb::connect_url(url).await?,
            None => MasherDb::from_env().await?,
        };

        let updates_path = config.updates.path.as_ref().ok_or_else(|| {
            MashError::Config("updates.path must point at the update export".to_string())
        })?;
        let updates = Arc::new(JsonUpdateStore::open(updates_path).await?);

        let bugs: Arc<dyn BugTracker> = match &config.bugzilla.url {
            Some(url) => Arc::new(BugzillaClient::new(
                url,
                config.bugzilla.api_key.clone(),
                config.notify.retry.timeout_ms,
            )?),
            None => Arc::new(LogBugTracker),
        };
        let mirror: Option<Arc<dyn MirrorStatus>> = match &config.mirror.base_url {
            Some(url) => Some(Arc::new(HttpMirrorStatus::new(
                url,
                config.mirror.retry.timeout_ms,
            )?)),
            None => None,
        };
        let bus: Arc<dyn MessageBus> = match &config.notify.bus_url {
            Some(url) => Arc::new(HttpBus::new(url, config.notify.retry.timeout_ms)?),
            None => Arc::new(LogBus),
        };

        let collab = Collaborators {
            builds: Arc::new(KojiCli::new(
                &config.builds.koji_command,
                config.builds.retry.timeout_ms,
            )),
            bugs,
            updates,
            mirror,
            bus,
            mailer: Arc::new(SpoolMailer::new(&config.paths.mail_spool)),
        };
        let backend = backend_from_config(&config.compose, &config.paths)?;

        Ok(Self::new(
            config,
            Arc::new(db.push_store()),
            Arc::new(db.lock_store()),
            collab,
            backend,
        ))
    }

    pub fn pipeline(&self) -> &PushPipeline {
        &self.pipeline
    }

    /// Authorize, plan and run every push of a trigger concurrently.
    ///
    /// An unauthorized trigger is an error and has no side effects. Per-push
    /// problems are reported, never propagated.
    #[instrument(skip_all, fields(sender = %event.sender, request = %event.request.as_str()))]
    pub async fn handle_trigger(&self, event: &TriggerEvent) -> Result<Vec<PushReport>> {
        self.authorizer.authorize(event)?;
        let plans = self.planner.plan(event.request, &event.releases).await?;
        if plans.is_empty() {
            info!("nothing to push");
            return Ok(Vec::new());
        }

        let runs = plans.iter().map(|plan| async move {
            match self.pipeline.start(plan).await {
                Ok(push) => PushReport::Accepted(push),
                Err(e @ MashError::LockConflict { .. }) => PushReport::Rejected {
                    repo: plan.repo.clone(),
                    reason: e.to_string(),
                },
                Err(error) => {
                    warn!(repo = %plan.repo, %error, "push did not run");
                    PushReport::Errored {
                        repo: plan.repo.clone(),
                        error,
                    }
                }
            }
        });
        Ok(join_all(runs).await)
    }

    /// Release locks left behind by pushes that finished or vanished, then
    /// resume every non-terminal push.
    #[instrument(skip_all)]
    pub async fn resume_incomplete(&self) -> Result<Vec<PushRecord>> {
        let pushes = self.pipeline.pushes();
        for lock in self.pipeline.lock().list().await? {
            let stale = match pushes.get_push(&lock.push_id).await {
                Ok(push) => push.is_terminal(),
                Err(StorageError::PushNotFound { .. }) => true,
                Err(e) => return Err(e.into()),
            };
            if stale {
                warn!(repo = %lock.repo, push_id = %lock.push_id, "releasing stale lock");
                self.pipeline.lock().release(&lock.repo, &lock.push_id).await?;
            }
        }

        let active = pushes.list_pushes(&PushFilter::active()).await?;
        info!(count = active.len(), "resuming incomplete pushes");
        let runs = active.iter().map(|push| self.pipeline.resume(&push.push_id));

        let mut resumed = Vec::new();
        for (push, result) in active.iter().zip(join_all(runs).await) {
            match result {
                Ok(record) => resumed.push(record),
                Err(e) => warn!(push_id = %push.push_id, error = %e, "resume failed"),
            }
        }
        Ok(resumed)
    }

    pub async fn resume(&self, push_id: &PushId) -> Result<PushRecord> {
        self.pipeline.resume(push_id).await
    }

    pub async fn show(&self, push_id: &PushId) -> Result<PushRecord> {
        Ok(self.pipeline.pushes().get_push(push_id).await?)
    }

    pub async fn list(&self, filter: &PushFilter) -> Result<Vec<PushRecord>> {
        Ok(self.pipeline.pushes().list_pushes(filter).await?)
    }

    pub async fn locks(&self) -> Result<Vec<LockRecord>> {
        self.pipeline.lock().list().await
    }

    pub async fn unlock(&self, repo: &RepoKey, operator: &str) -> Result<Option<ForcedUnlock>> {
        self.pipeline.lock().force_unlock(repo, operator).await
    }

    /// Ask a running push to stop at its next phase boundary. Returns false
    /// when the push has already finished.
    pub async fn cancel(&self, push_id: &PushId) -> Result<bool> {
        let accepted = self.pipeline.pushes().request_cancel(push_id).await?;
        info!(push_id = %push_id, accepted, "cancellation requested");
        Ok(accepted)
    }

    /// Delete old composes of `repo`, sparing whatever the push currently
    /// holding its lock has written.
    pub async fn prune(&self, repo: &RepoKey, keep: usize) -> Result<Vec<std::path::PathBuf>> {
        let holder = self.pipeline.lock().holder(repo).await?;
        self.pipeline
            .switcher()
            .prune(repo, keep, holder.as_ref().map(|lock| &lock.push_id))
            .await
    }
}
