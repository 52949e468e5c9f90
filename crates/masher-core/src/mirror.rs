//! MirrorWaiter: polls the master mirror until it serves the published index.

use std::sync::Arc;

use masher_state::RepoKey;
use tracing::{info, instrument, warn};

use crate::collab::{CollabError, MirrorStatus};
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy, Transient};

/// One unsuccessful poll.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror serves {observed:?}, waiting for {expected}")]
    NotYet {
        expected: String,
        observed: Option<String>,
    },

    #[error("mirror query failed: {0}")]
    Query(#[from] CollabError),
}

impl Transient for MirrorError {
    fn is_transient(&self) -> bool {
        match self {
            MirrorError::NotYet { .. } => true,
            MirrorError::Query(e) => e.is_transient(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorWait {
    Confirmed { attempts: u32 },
    TimedOut { attempts: u32, reason: String },
}

pub struct MirrorWaiter {
    status: Arc<dyn MirrorStatus>,
    policy: RetryPolicy,
}

impl MirrorWaiter {
    pub fn new(status: Arc<dyn MirrorStatus>, policy: RetryPolicy) -> Self {
        Self { status, policy }
    }

    /// Wait until the mirror's index digest for `repo` equals `expected`.
    /// Never fails: giving up is reported as [`MirrorWait::TimedOut`].
    #[instrument(skip(self), fields(repo = %repo))]
    pub async fn wait(&self, repo: &RepoKey, expected: &str) -> MirrorWait {
        let status = &self.status;
        let result = retry_with_backoff(&self.policy, "mirror poll", |_| async move {
            match status.index_digest(repo).await? {
                Some(observed) if observed == expected => Ok(()),
                observed => Err(MirrorError::NotYet {
                    expected: expected.to_string(),
                    observed,
                }),
            }
        })
        .await;

        match result {
            Ok(done) => {
                info!(attempts = done.attempts, "mirror confirmed");
                MirrorWait::Confirmed {
                    attempts: done.attempts,
                }
            }
            Err(failure) => {
                let attempts = failure.attempts();
                let reason = match &failure {
                    RetryFailure::Fatal { error, .. } => error.to_string(),
                    other => other.to_string(),
                };
                warn!(attempts, %reason, "mirror did not confirm");
                MirrorWait::TimedOut { attempts, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::StaleMirror;
    use async_trait::async_trait;
    use masher_state::RequestType;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves the expected digest from the third poll on.
    struct Lagging {
        polls: AtomicU32,
    }

    #[async_trait]
    impl MirrorStatus for Lagging {
        async fn index_digest(&self, _repo: &RepoKey) -> crate::collab::CollabResult<Option<String>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n >= 3).then(|| "abc".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_after_lag() {
        let waiter = MirrorWaiter::new(
            Arc::new(Lagging {
                polls: AtomicU32::new(0),
            }),
            RetryPolicy::new(5, 1_000),
        );
        let repo = RepoKey::new("F17", RequestType::Stable);
        assert_eq!(
            waiter.wait(&repo, "abc").await,
            MirrorWait::Confirmed { attempts: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let mirror = Arc::new(StaleMirror::new());
        let waiter = MirrorWaiter::new(mirror.clone(), RetryPolicy::new(4, 1_000));
        let repo = RepoKey::new("F17", RequestType::Stable);
        match waiter.wait(&repo, "abc").await {
            MirrorWait::TimedOut { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(mirror.polls(), 4);
    }
}
