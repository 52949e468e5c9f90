//! Masher Core Library
//!
//! The release-push orchestrator: turns an authorized trigger into pushes,
//! one per repository, and drives each through build moves, compose,
//! metadata injection, sanity checks, publication, mirror confirmation and
//! notifications.

pub mod auth;
pub mod collab;
pub mod compose;
pub mod config;
pub mod error;
pub mod fakes;
pub mod lock;
pub mod masher;
pub mod metrics;
pub mod mirror;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod planner;
pub mod publish;
pub mod retry;
pub mod sanity;
pub mod tags;
pub mod telemetry;
pub mod updateinfo;

pub use auth::{TriggerAuthorizer, TriggerEvent};
pub use collab::{
    BugTracker, BuildSystem, BusMessage, CollabError, Mail, Mailer, MessageBus, MirrorStatus,
    Topic, UpdateStore,
};
pub use compose::{
    backend_from_config, ComposeBackend, ComposeError, CommandBackend, CopyBackend, RepoComposer,
    RepoIndex,
};
pub use config::MasherConfig;
pub use error::{MashError, Result};
pub use lock::{ForcedUnlock, RepoLock};
pub use masher::{Masher, PushReport};
pub use mirror::{MirrorWait, MirrorWaiter};
pub use notify::{DeliveryError, NotificationEmitter};
pub use pipeline::{Collaborators, PushPipeline};
pub use planner::{plan_updates, PlannedPush, PushPlanner};
pub use publish::{PublishSwitcher, Switched};
pub use retry::RetryPolicy;
pub use sanity::{SanityChecker, SanityReport};
pub use telemetry::init_tracing;
pub use updateinfo::MetadataInjector;

pub use masher_state::{
    Caveat, CaveatKind, LockRecord, Phase, PhaseRecord, PushFilter, PushId, PushOutcome,
    PushRecord, RepoKey, RequestType,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
