//! Error types for masher-state

use thiserror::Error;

/// Errors raised while connecting to or initialising the database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors produced by the `PushStore` and `LockStore` contracts.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("push not found: {push_id}")]
    PushNotFound { push_id: String },

    #[error("push already exists: {push_id}")]
    DuplicatePush { push_id: String },

    /// Terminal pushes are an audit trail and never change again.
    #[error("push {push_id} is terminal and cannot be modified")]
    ImmutablePush { push_id: String },

    #[error("push {push_id}: phase history is append-only ({reason})")]
    PhaseHistoryRewrite { push_id: String, reason: String },

    #[error("push {push_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        push_id: String,
        from: String,
        to: String,
    },

    #[error("invalid repository key: {0}")]
    InvalidRepoKey(String),

    #[error("invalid NVR: {0}")]
    InvalidNvr(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ImmutablePush {
            push_id: "p-1".to_string(),
        };
        assert!(err.to_string().contains("terminal"));

        let err = StorageError::InvalidTransition {
            push_id: "p-1".to_string(),
            from: "locked".to_string(),
            to: "published".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("locked"));
        assert!(msg.contains("published"));
    }
}
