//! RepoComposer: assembles a self-contained repository tree for a push.
//!
//! Each attempt writes into a fresh directory
//! `<compose_root>/<repo>-<yyyymmdd.HHMMSS>-<push short id>` and removes it
//! again if the attempt fails. The published tree is never touched here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use masher_state::{Nvr, PushRecord, RepoKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::{ComposeBackendKind, ComposeConfig, PathsConfig};
use crate::error::{MashError, Result};
use crate::metrics::METRICS;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy, Transient};

pub const REPODATA_DIR: &str = "repodata";
pub const INDEX_FILE: &str = "repomd.json";
pub const PACKAGES_DIR: &str = "Packages";
pub const MANIFEST_FILE: &str = "builds.json";

/// `ENOSPC` on Linux and the BSDs.
const ENOSPC: i32 = 28;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Why a compose attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ComposeError {
    /// Whether another attempt could succeed.
    pub transient: bool,
    pub reason: String,
}

impl ComposeError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            transient: true,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            transient: false,
            reason: reason.into(),
        }
    }

    /// Classify an I/O error: missing inputs and a full disk are fatal.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            return Self::fatal(format!("{context}: disk exhausted ({err})"));
        }
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::fatal(format!("{context}: {err}"))
            }
            _ => Self::transient(format!("{context}: {err}")),
        }
    }
}

impl Transient for ComposeError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

// ---------------------------------------------------------------------------
// Tree layout
// ---------------------------------------------------------------------------

/// Input handed to the compose backend, written as `builds.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub repo: String,
    pub push_id: String,
    pub builds: Vec<Nvr>,
}

impl BuildManifest {
    pub fn for_push(push: &PushRecord) -> Self {
        let mut builds: Vec<Nvr> = push.builds().map(|b| b.nvr.clone()).collect();
        builds.sort();
        Self {
            repo: push.repo.to_string(),
            push_id: push.push_id.to_string(),
            builds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub nvr: Nvr,
    /// Path relative to the tree root.
    pub href: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub href: String,
    pub sha256: String,
    pub size: u64,
}

/// `repodata/repomd.json`: the package list plus auxiliary metadata files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndex {
    pub repo: String,
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub data: BTreeMap<String, DataEntry>,
}

impl RepoIndex {
    pub fn path(tree: &Path) -> PathBuf {
        tree.join(REPODATA_DIR).join(INDEX_FILE)
    }

    pub async fn load(tree: &Path) -> std::result::Result<Self, ComposeError> {
        let path = Self::path(tree);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ComposeError::from_io(&path.display().to_string(), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ComposeError::fatal(format!("{}: {e}", path.display())))
    }

    /// Write through a temp file so the index is never half-written.
    pub async fn store(&self, tree: &Path) -> std::result::Result<(), ComposeError> {
        let path = Self::path(tree);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| ComposeError::fatal(format!("cannot encode index: {e}")))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| ComposeError::from_io(&path.display().to_string(), e))
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Directory name for a compose of `repo` started now.
pub fn compose_dir_name(repo: &RepoKey, push_short: &str) -> String {
    format!("{repo}-{}-{push_short}", Utc::now().format("%Y%m%d.%H%M%S"))
}

/// Whether `name` is a compose directory of `repo` (and not, say, of
/// `<repo>-testing`).
pub fn is_compose_of(repo: &RepoKey, name: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(&repo.to_string())
        .and_then(|r| r.strip_prefix('-'))
    else {
        return false;
    };
    let bytes = rest.as_bytes();
    bytes.len() > 16
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'.'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'-'
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// One compose attempt's inputs.
#[derive(Debug, Clone)]
pub struct ComposeJob {
    pub repo: RepoKey,
    pub output: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: BuildManifest,
}

/// Produces `Packages/` and `repodata/repomd.json` under `job.output`.
#[async_trait]
pub trait ComposeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compose(&self, job: &ComposeJob) -> std::result::Result<(), ComposeError>;
}

/// Built-in backend: copies artifacts from
/// `<artifact_root>/<name>/<version>/<release>/*.rpm` and indexes them.
#[derive(Debug, Clone)]
pub struct CopyBackend {
    artifact_root: PathBuf,
}

impl CopyBackend {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
        }
    }

    async fn artifacts_of(&self, nvr: &Nvr) -> std::result::Result<Vec<PathBuf>, ComposeError> {
        let dir = self
            .artifact_root
            .join(&nvr.name)
            .join(&nvr.version)
            .join(&nvr.release);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| ComposeError::fatal(format!("missing artifacts for {nvr} in {}", dir.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ComposeError::from_io(&dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "rpm") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(ComposeError::fatal(format!(
                "no packages for {nvr} in {}",
                dir.display()
            )));
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ComposeBackend for CopyBackend {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn compose(&self, job: &ComposeJob) -> std::result::Result<(), ComposeError> {
        let packages_dir = job.output.join(PACKAGES_DIR);
        tokio::fs::create_dir_all(&packages_dir)
            .await
            .map_err(|e| ComposeError::from_io("create Packages", e))?;

        let mut packages = Vec::new();
        for nvr in &job.manifest.builds {
            for src in self.artifacts_of(nvr).await? {
                let Some(file_name) = src.file_name().and_then(|f| f.to_str()) else {
                    return Err(ComposeError::fatal(format!(
                        "non-utf8 artifact name {}",
                        src.display()
                    )));
                };
                let dest = packages_dir.join(file_name);
                let bytes = tokio::fs::read(&src)
                    .await
                    .map_err(|e| ComposeError::from_io(&src.display().to_string(), e))?;
                tokio::fs::write(&dest, &bytes)
                    .await
                    .map_err(|e| ComposeError::from_io(&dest.display().to_string(), e))?;
                packages.push(PackageEntry {
                    nvr: nvr.clone(),
                    href: format!("{PACKAGES_DIR}/{file_name}"),
                    sha256: sha256_hex(&bytes),
                    size: bytes.len() as u64,
                });
            }
        }
        packages.sort_by(|a, b| a.href.cmp(&b.href));

        RepoIndex {
            repo: job.repo.to_string(),
            packages,
            data: BTreeMap::new(),
        }
        .store(&job.output)
        .await
    }
}

/// External compose tool. `{manifest}`, `{output}` and `{repo}` in the argv
/// are substituted per job.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
    transient_exit_codes: Vec<i32>,
}

impl CommandBackend {
    pub fn new(argv: Vec<String>, transient_exit_codes: Vec<i32>) -> Result<Self> {
        if argv.is_empty() {
            return Err(MashError::Config("compose command is empty".to_string()));
        }
        Ok(Self {
            argv,
            transient_exit_codes,
        })
    }

    fn render_args(&self, job: &ComposeJob) -> Vec<String> {
        let manifest = job.manifest_path.display().to_string();
        let output = job.output.display().to_string();
        let repo = job.repo.to_string();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{manifest}", &manifest)
                    .replace("{output}", &output)
                    .replace("{repo}", &repo)
            })
            .collect()
    }
}

#[async_trait]
impl ComposeBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn compose(&self, job: &ComposeJob) -> std::result::Result<(), ComposeError> {
        let args = self.render_args(job);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ComposeError::fatal("compose command is empty"))?;
        debug!(%program, args = ?rest, "running compose tool");

        let output = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComposeError::from_io(&format!("spawn {program}"), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            let reason = format!("{program} exited with {}: {tail}", output.status);
            return match output.status.code() {
                Some(code) if self.transient_exit_codes.contains(&code) => {
                    Err(ComposeError::transient(reason))
                }
                _ => Err(ComposeError::fatal(reason)),
            };
        }

        if !tokio::fs::try_exists(RepoIndex::path(&job.output))
            .await
            .unwrap_or(false)
        {
            return Err(ComposeError::fatal(format!(
                "{program} produced no {REPODATA_DIR}/{INDEX_FILE}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RepoComposer
// ---------------------------------------------------------------------------

/// The compose backend selected by `[compose]`.
pub fn backend_from_config(
    compose: &ComposeConfig,
    paths: &PathsConfig,
) -> Result<Arc<dyn ComposeBackend>> {
    Ok(match compose.backend {
        ComposeBackendKind::Copy => Arc::new(CopyBackend::new(&paths.artifact_root)),
        ComposeBackendKind::Command => Arc::new(CommandBackend::new(
            compose.command.clone(),
            compose.transient_exit_codes.clone(),
        )?),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeOutput {
    pub path: PathBuf,
    pub attempts: u32,
}

pub struct RepoComposer {
    compose_root: PathBuf,
    backend: Arc<dyn ComposeBackend>,
    policy: RetryPolicy,
}

impl RepoComposer {
    pub fn new(compose_root: impl Into<PathBuf>, backend: Arc<dyn ComposeBackend>, policy: RetryPolicy) -> Self {
        Self {
            compose_root: compose_root.into(),
            backend,
            policy,
        }
    }

    pub fn compose_root(&self) -> &Path {
        &self.compose_root
    }

    /// Compose the push's builds into a new directory, retrying transient
    /// failures with backoff.
    #[instrument(skip_all, fields(push_id = %push.push_id, repo = %push.repo, backend = self.backend.name()))]
    pub async fn compose(&self, push: &PushRecord) -> Result<ComposeOutput> {
        let started = Instant::now();
        let manifest = BuildManifest::for_push(push);
        // The per-attempt limit is enforced inside `attempt` so a timed-out
        // attempt can still clean up its directory.
        let policy = self.policy.clone().with_timeout_ms(0);

        let result = retry_with_backoff(&policy, "compose", |attempt| {
            let manifest = manifest.clone();
            let repo = push.repo.clone();
            let short = push.push_id.short().to_string();
            async move { self.attempt(repo, &short, manifest, attempt).await }
        })
        .await;

        match result {
            Ok(done) => {
                for _ in 1..done.attempts {
                    METRICS.inc_compose_retries();
                }
                info!(
                    path = %done.value.display(),
                    attempts = done.attempts,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "compose finished"
                );
                Ok(ComposeOutput {
                    path: done.value,
                    attempts: done.attempts,
                })
            }
            Err(failure) => {
                for _ in 1..failure.attempts() {
                    METRICS.inc_compose_retries();
                }
                let error = match failure {
                    RetryFailure::Fatal { error, .. } => error,
                    other => ComposeError::fatal(other.to_string()),
                };
                Err(MashError::ComposeFailure(error))
            }
        }
    }

    async fn attempt(
        &self,
        repo: RepoKey,
        short: &str,
        manifest: BuildManifest,
        attempt: u32,
    ) -> std::result::Result<PathBuf, ComposeError> {
        tokio::fs::create_dir_all(&self.compose_root)
            .await
            .map_err(|e| ComposeError::from_io("create compose root", e))?;

        let mut output = self.compose_root.join(compose_dir_name(&repo, short));
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            let name = format!("{}.{attempt}", output.display());
            output = PathBuf::from(name);
        }
        tokio::fs::create_dir(&output)
            .await
            .map_err(|e| ComposeError::from_io(&output.display().to_string(), e))?;

        let manifest_path = output.join(MANIFEST_FILE);
        let job = ComposeJob {
            repo,
            output: output.clone(),
            manifest_path,
            manifest,
        };

        let run = async {
            let bytes = serde_json::to_vec_pretty(&job.manifest)
                .map_err(|e| ComposeError::fatal(format!("cannot encode manifest: {e}")))?;
            tokio::fs::write(&job.manifest_path, bytes)
                .await
                .map_err(|e| ComposeError::from_io("write manifest", e))?;
            self.backend.compose(&job).await
        };

        let outcome = match self.policy.timeout() {
            Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                Err(ComposeError::transient(format!(
                    "compose attempt exceeded {}ms",
                    self.policy.timeout_ms
                )))
            }),
            None => run.await,
        };

        if let Err(error) = outcome {
            warn!(attempt, path = %output.display(), error = %error, "compose attempt failed");
            if let Err(e) = tokio::fs::remove_dir_all(&output).await {
                warn!(path = %output.display(), error = %e, "could not remove failed compose");
            }
            return Err(error);
        }
        Ok(output)
    }
}
