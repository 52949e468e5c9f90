//! Masher configuration.
//!
//! Read from a TOML file (`--config` or `MASHER_CONFIG`); every section has
//! defaults, and secrets or endpoints can be overridden from the environment.
//!
//! ```toml
//! [releng]
//! allowed_senders = ["releng-bot", "alice"]
//! # or trigger_secret via MASHER_TRIGGER_SECRET
//! allow_unsigned = false
//!
//! [paths]
//! compose_root = "/srv/masher/composes"
//! publish_root = "/srv/masher/pub"
//! artifact_root = "/srv/koji/packages"
//!
//! [compose]
//! backend = "command"
//! command = ["createrepo-wrapper", "--manifest", "{manifest}", "--out", "{output}"]
//! transient_exit_codes = [75]
//!
//! [compose.retry]
//! max_attempts = 3
//! timeout_ms = 1800000
//!
//! [mirror]
//! base_url = "https://dl.example.org/pub/updates"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MashError, Result};
use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "MASHER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasherConfig {
    #[serde(default)]
    pub releng: RelengConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub builds: BuildsConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub bugzilla: BugzillaConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Who may trigger pushes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelengConfig {
    /// Empty means nobody: triggers fail closed.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Shared secret for trigger HMAC signatures.
    #[serde(default)]
    pub trigger_secret: Option<String>,
    /// Accept unsigned triggers when no secret is set. Off unless enabled
    /// explicitly; without a secret or this flag every trigger is rejected.
    #[serde(default)]
    pub allow_unsigned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_compose_root")]
    pub compose_root: PathBuf,
    #[serde(default = "default_publish_root")]
    pub publish_root: PathBuf,
    /// Build artifacts laid out as `<name>/<version>/<release>/*.rpm`.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Spool directory for outgoing mail when no relay is configured.
    #[serde(default = "default_mail_spool")]
    pub mail_spool: PathBuf,
}

fn default_compose_root() -> PathBuf {
    PathBuf::from("/var/lib/masher/composes")
}

fn default_publish_root() -> PathBuf {
    PathBuf::from("/var/lib/masher/pub")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("/mnt/koji/packages")
}

fn default_mail_spool() -> PathBuf {
    PathBuf::from("/var/spool/masher/mail")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            compose_root: default_compose_root(),
            publish_root: default_publish_root(),
            artifact_root: default_artifact_root(),
            mail_spool: default_mail_spool(),
        }
    }
}

impl PathsConfig {
    /// All four directories under one root (local runs and tests).
    pub fn under(root: &Path) -> Self {
        Self {
            compose_root: root.join("composes"),
            publish_root: root.join("pub"),
            artifact_root: root.join("artifacts"),
            mail_spool: root.join("mail"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeBackendKind {
    /// Built-in tree assembly from the artifact root.
    #[default]
    Copy,
    /// External compose tool.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    #[serde(default)]
    pub backend: ComposeBackendKind,
    /// Argv for the command backend; `{manifest}`, `{output}` and `{repo}`
    /// are substituted.
    #[serde(default)]
    pub command: Vec<String>,
    /// Exit codes of the compose tool that are worth retrying.
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
    #[serde(default = "default_compose_retry")]
    pub retry: RetryPolicy,
}

fn default_compose_retry() -> RetryPolicy {
    RetryPolicy::new(3, 5_000).with_timeout_ms(30 * 60 * 1000)
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            backend: ComposeBackendKind::Copy,
            command: Vec::new(),
            transient_exit_codes: Vec::new(),
            retry: default_compose_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildsConfig {
    /// Build-system client binary.
    #[serde(default = "default_koji_command")]
    pub koji_command: String,
    #[serde(default = "default_builds_retry")]
    pub retry: RetryPolicy,
}

fn default_koji_command() -> String {
    "koji".to_string()
}

fn default_builds_retry() -> RetryPolicy {
    RetryPolicy::new(3, 2_000).with_timeout_ms(5 * 60 * 1000)
}

impl Default for BuildsConfig {
    fn default() -> Self {
        Self {
            koji_command: default_koji_command(),
            retry: default_builds_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Master mirror base URL; when unset the mirror wait is skipped with a
    /// caveat.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_mirror_retry")]
    pub retry: RetryPolicy,
}

fn default_mirror_retry() -> RetryPolicy {
    RetryPolicy::new(30, 10_000)
        .with_max_delay_ms(5 * 60 * 1000)
        .with_timeout_ms(30_000)
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            retry: default_mirror_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Message bus publish endpoint; log-only when unset.
    #[serde(default)]
    pub bus_url: Option<String>,
    #[serde(default = "default_notify_retry")]
    pub retry: RetryPolicy,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_announce_list")]
    pub announce_list: String,
    #[serde(default = "default_testing_list")]
    pub testing_list: String,
    /// Prefix for bug references in advisories and mails.
    #[serde(default = "default_bug_url_base")]
    pub bug_url_base: String,
}

fn default_notify_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1_000).with_timeout_ms(10_000)
}

fn default_from_address() -> String {
    "updates@example.org".to_string()
}

fn default_announce_list() -> String {
    "package-announce@lists.example.org".to_string()
}

fn default_testing_list() -> String {
    "test@lists.example.org".to_string()
}

fn default_bug_url_base() -> String {
    "https://bugzilla.redhat.com/show_bug.cgi?id=".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            bus_url: None,
            retry: default_notify_retry(),
            from_address: default_from_address(),
            announce_list: default_announce_list(),
            testing_list: default_testing_list(),
            bug_url_base: default_bug_url_base(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BugzillaConfig {
    /// REST base URL, e.g. `https://bugzilla.example.org/rest`; bug updates
    /// are only logged when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// JSON export of approved updates from the governance service.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host`). Falls back
    /// to the `SURREALDB_*` environment when unset.
    #[serde(default)]
    pub url: Option<String>,
}

impl MasherConfig {
    /// Load from `path`, else from `$MASHER_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => {
                let raw = std::fs::read_to_string(&p).map_err(|e| {
                    MashError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                debug!(path = %p.display(), "loaded masher config");
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| MashError::Config(e.to_string()))
    }

    /// Apply `MASHER_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MASHER_TRIGGER_SECRET") {
            self.releng.trigger_secret = Some(v);
        }
        if let Some(v) = lookup("MASHER_MIRROR_BASE") {
            self.mirror.base_url = Some(v);
        }
        if let Some(v) = lookup("MASHER_BUS_URL") {
            self.notify.bus_url = Some(v);
        }
        if let Some(v) = lookup("MASHER_BUGZILLA_URL") {
            self.bugzilla.url = Some(v);
        }
        if let Some(v) = lookup("MASHER_BUGZILLA_API_KEY") {
            self.bugzilla.api_key = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compose.backend == ComposeBackendKind::Command && self.compose.command.is_empty() {
            return Err(MashError::Config(
                "compose.backend = \"command\" requires compose.command".to_string(),
            ));
        }
        if self.paths.compose_root == self.paths.publish_root {
            return Err(MashError::Config(
                "paths.compose_root and paths.publish_root must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = MasherConfig::from_toml_str("").unwrap();
        assert!(cfg.releng.allowed_senders.is_empty());
        assert!(!cfg.releng.allow_unsigned);
        assert_eq!(cfg.compose.backend, ComposeBackendKind::Copy);
        assert_eq!(cfg.builds.koji_command, "koji");
        assert!(cfg.mirror.retry.max_attempts > 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_sections() {
        let raw = r#"
            [releng]
            allowed_senders = ["releng-bot"]

            [paths]
            compose_root = "/tmp/c"
            publish_root = "/tmp/p"

            [compose]
            backend = "command"
            command = ["mash", "{manifest}", "{output}"]
            transient_exit_codes = [75]

            [compose.retry]
            max_attempts = 5
            base_delay_ms = 10
        "#;
        let cfg = MasherConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.releng.allowed_senders, vec!["releng-bot"]);
        assert_eq!(cfg.paths.compose_root, PathBuf::from("/tmp/c"));
        assert_eq!(cfg.compose.backend, ComposeBackendKind::Command);
        assert_eq!(cfg.compose.transient_exit_codes, vec![75]);
        assert_eq!(cfg.compose.retry.max_attempts, 5);
        assert_eq!(cfg.compose.retry.max_delay_ms, 30_000);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_command_backend_requires_command() {
        let cfg = MasherConfig::from_toml_str("[compose]\nbackend = \"command\"").unwrap();
        assert!(matches!(cfg.validate(), Err(MashError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = MasherConfig::default();
        cfg.apply_overrides(|key| match key {
            "MASHER_TRIGGER_SECRET" => Some("s3cret".to_string()),
            "MASHER_MIRROR_BASE" => Some("https://mirror".to_string()),
            _ => None,
        });
        assert_eq!(cfg.releng.trigger_secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.mirror.base_url.as_deref(), Some("https://mirror"));
        assert!(cfg.notify.bus_url.is_none());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = MasherConfig::from_toml_str("[compose]\nbackend = \"magic\"").unwrap_err();
        assert!(matches!(err, MashError::Config(_)));
    }
}
