//! Collaborator interfaces consumed by the pipeline.
//!
//! The orchestrator depends on each external system through one of these
//! traits:
//! - `BuildSystem`: tag moves and buildroot overrides (koji)
//! - `BugTracker`: closing and commenting on tickets (bugzilla)
//! - `UpdateStore`: the governance service's update records
//! - `MirrorStatus`: what the master mirror currently serves
//! - `MessageBus` / `Mailer`: outgoing notifications
//!
//! Production adapters live in the submodules; in-memory versions are in
//! [`crate::fakes`].

pub mod bugzilla;
pub mod http;
pub mod koji;
pub mod mail;
pub mod update_store;

use async_trait::async_trait;
use masher_state::{Comment, Nvr, PushId, RepoKey, RequestType, StorageError, Update, UpdateStatus};
use serde::{Deserialize, Serialize};

use crate::retry::Transient;

pub use bugzilla::{BugzillaClient, LogBugTracker};
pub use http::{HttpBus, HttpMirrorStatus};
pub use koji::KojiCli;
pub use mail::{LogBus, LogMailer, SpoolMailer};
pub use update_store::JsonUpdateStore;

/// Errors reported by collaborator adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    #[error("{service} request failed: {reason}")]
    Request {
        service: &'static str,
        reason: String,
    },

    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout {
        service: &'static str,
        timeout_ms: u64,
    },

    /// The collaborator rejected the call; retrying will not help.
    #[error("{service} rejected the request: {reason}")]
    Rejected {
        service: &'static str,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),
}

impl Transient for CollabError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            CollabError::Request { .. } | CollabError::Timeout { .. } | CollabError::Io(_)
        )
    }
}

impl From<std::io::Error> for CollabError {
    fn from(err: std::io::Error) -> Self {
        CollabError::Io(err.to_string())
    }
}

impl From<StorageError> for CollabError {
    fn from(err: StorageError) -> Self {
        CollabError::Rejected {
            service: "store",
            reason: err.to_string(),
        }
    }
}

pub type CollabResult<T> = std::result::Result<T, CollabError>;

// ---------------------------------------------------------------------------
// Build system
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BuildSystem: Send + Sync {
    /// Tags currently applied to a build.
    async fn build_tags(&self, nvr: &Nvr) -> CollabResult<Vec<String>>;

    /// Atomically retag a build from one tag to another.
    async fn move_build(&self, nvr: &Nvr, from_tag: &str, to_tag: &str) -> CollabResult<()>;

    async fn tag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()>;

    async fn untag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()>;

    /// Builds currently tagged into a release's override tag.
    async fn list_overrides(&self, override_tag: &str) -> CollabResult<Vec<Nvr>>;
}

// ---------------------------------------------------------------------------
// Bug tracker
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BugTracker: Send + Sync {
    /// Close a ticket as fixed, leaving `comment`.
    async fn close(&self, bug_id: u64, comment: &str) -> CollabResult<()>;

    async fn comment(&self, bug_id: u64, text: &str) -> CollabResult<()>;

    async fn update_title(&self, bug_id: u64, title: &str) -> CollabResult<()>;
}

// ---------------------------------------------------------------------------
// Update store
// ---------------------------------------------------------------------------

/// Read/write access to the governance service's updates.
///
/// The masher only changes the staged marker, publication status and system
/// comments; approval is never re-evaluated here.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// Updates approved for `request` and not yet published there.
    async fn eligible_updates(&self, request: RequestType) -> CollabResult<Vec<Update>>;

    async fn get_update(&self, id: &str) -> CollabResult<Update>;

    async fn mark_staged(&self, id: &str, push_id: &PushId) -> CollabResult<()>;

    /// Set the publication status and clear the pending request.
    async fn set_status(&self, id: &str, status: UpdateStatus) -> CollabResult<()>;

    async fn add_comment(&self, id: &str, comment: Comment) -> CollabResult<()>;
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MirrorStatus: Send + Sync {
    /// sha256 of the repo index the master mirror currently serves for
    /// `repo`, or `None` if the mirror has nothing for it yet.
    async fn index_digest(&self, repo: &RepoKey) -> CollabResult<Option<String>>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Bus topics the masher publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "mash-started")]
    MashStarted,
    #[serde(rename = "mash-completed")]
    MashCompleted,
    #[serde(rename = "buildroot_override.tag")]
    BuildrootOverrideTag,
    #[serde(rename = "buildroot_override.untag")]
    BuildrootOverrideUntag,
    #[serde(rename = "errata-published")]
    ErrataPublished,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MashStarted => "mash-started",
            Topic::MashCompleted => "mash-completed",
            Topic::BuildrootOverrideTag => "buildroot_override.tag",
            Topic::BuildrootOverrideUntag => "buildroot_override.untag",
            Topic::ErrataPublished => "errata-published",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus message. Every topic carries push id, release, request type and
/// outcome; `body` holds topic-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: Topic,
    pub push_id: String,
    pub release: String,
    pub request: RequestType,
    pub outcome: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> CollabResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> CollabResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::MashStarted.as_str(), "mash-started");
        assert_eq!(
            serde_json::to_string(&Topic::BuildrootOverrideUntag).unwrap(),
            "\"buildroot_override.untag\""
        );
    }

    #[test]
    fn test_transient_classification() {
        let t = CollabError::Timeout {
            service: "koji",
            timeout_ms: 10,
        };
        assert!(t.is_transient());
        assert!(!CollabError::NotFound("x".to_string()).is_transient());
        let r = CollabError::Rejected {
            service: "bugzilla",
            reason: "no such bug".to_string(),
        };
        assert!(!r.is_transient());
    }
}
