//! Masher-State: SurrealDB Backend for the push orchestrator
//!
//! This crate provides the persistence layer for the masher. It owns the
//! push records (with their append-only phase history) and the per-repository
//! lock table, and defines the update/build types the orchestrator plans from.
//!
//! ## Key Components
//!
//! - `MasherDb`: Manages the connection and runs schema migrations
//! - `PushStore` / `LockStore`: Backend-agnostic persistence traits
//! - `SurrealPushStore` / `SurrealLockStore`: SurrealDB implementations
//! - `fakes`: In-memory implementations for tests

mod error;
pub mod fakes;
mod handle;
mod migrations;
pub mod model;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{LoginScope, MasherDb, StoreLogin, StoreTarget};
pub use model::{
    Bug, Build, BuildrootOverride, Comment, Nvr, RepoKey, RequestType, Update, UpdateStatus,
    UpdateType,
};
pub use storage_traits::{
    Caveat, CaveatKind, LockAcquire, LockRecord, LockStore, Phase, PhaseOutcome, PhaseRecord,
    PhaseRecordKind, PushFilter, PushId, PushOutcome, PushRecord, PushStore, StorageResult,
};
pub use surreal_store::{SurrealLockStore, SurrealPushStore};

/// Result type for masher-state connection operations
pub type Result<T> = std::result::Result<T, StateError>;
