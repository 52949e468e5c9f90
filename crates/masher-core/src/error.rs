//! Error taxonomy for the push orchestrator.

use masher_state::{StateError, StorageError};

use crate::collab::CollabError;
use crate::compose::ComposeError;
use crate::notify::DeliveryError;

/// Masher errors.
///
/// Only `Storage` leaves a push in a resumable, non-terminal state; every
/// other variant raised by a phase before `Published` fails the push.
#[derive(Debug, thiserror::Error)]
pub enum MashError {
    #[error("trigger rejected: {0}")]
    Authorization(String),

    #[error("repository {repo} is locked by push {holder}")]
    LockConflict { repo: String, holder: String },

    #[error("planning conflict: {0}")]
    PlanningConflict(String),

    #[error("compose failed: {0}")]
    ComposeFailure(#[from] ComposeError),

    #[error("sanity check failed: {0}")]
    SanityCheckFailure(String),

    #[error("mirror did not confirm {repo} after {attempts} attempt(s)")]
    MirrorTimeout { repo: String, attempts: u32 },

    #[error("notification delivery failed: {0}")]
    NotificationDelivery(#[from] DeliveryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state store unavailable: {0}")]
    State(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("build system error: {0}")]
    BuildSystem(String),

    #[error("push {push_id} was cancelled")]
    Cancelled { push_id: String },

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollabError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MashError {
    /// Errors that must not fail the push: the store is unavailable, so the
    /// pipeline stops and the push is resumed later.
    pub fn is_storage(&self) -> bool {
        matches!(self, MashError::Storage(_) | MashError::State(_))
    }
}

/// Result type for masher operations.
pub type Result<T> = std::result::Result<T, MashError>;
