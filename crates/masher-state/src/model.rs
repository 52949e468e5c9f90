//! Update, build and repository types shared by the store and the orchestrator.
//!
//! Updates are owned by the update-governance CRUD layer. The orchestrator
//! receives them as snapshots and only ever changes their publication status,
//! the staged marker and the system comments.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Request type and repository key
// ---------------------------------------------------------------------------

/// Publication target of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Testing,
    Stable,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Testing => "testing",
            RequestType::Stable => "stable",
        }
    }

    /// Status an update reaches once a push of this type publishes it.
    pub fn target_status(&self) -> UpdateStatus {
        match self {
            RequestType::Testing => UpdateStatus::Testing,
            RequestType::Stable => UpdateStatus::Stable,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testing" => Ok(RequestType::Testing),
            "stable" => Ok(RequestType::Stable),
            other => Err(StorageError::InvalidRepoKey(format!(
                "unknown request type '{other}'"
            ))),
        }
    }
}

/// Identifies a compose target: one release published to one request type.
///
/// The display form (`f17-updates`, `f17-updates-testing`) is the lock key
/// and the name of the public repo pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoKey {
    pub release: String,
    pub request: RequestType,
}

impl RepoKey {
    /// Release names are normalised to upper case (`f17` -> `F17`).
    pub fn new(release: impl AsRef<str>, request: RequestType) -> Self {
        Self {
            release: release.as_ref().trim().to_ascii_uppercase(),
            request,
        }
    }

    /// Lower-cased release prefix used for tags and repo names.
    pub fn release_prefix(&self) -> String {
        self.release.to_ascii_lowercase()
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request {
            RequestType::Stable => write!(f, "{}-updates", self.release_prefix()),
            RequestType::Testing => write!(f, "{}-updates-testing", self.release_prefix()),
        }
    }
}

impl FromStr for RepoKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (release, request) = if let Some(rel) = s.strip_suffix("-updates-testing") {
            (rel, RequestType::Testing)
        } else if let Some(rel) = s.strip_suffix("-updates") {
            (rel, RequestType::Stable)
        } else {
            return Err(StorageError::InvalidRepoKey(s.to_string()));
        };
        if release.is_empty() {
            return Err(StorageError::InvalidRepoKey(s.to_string()));
        }
        Ok(RepoKey::new(release, request))
    }
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Name-version-release identifier of a build (`kernel-3.4.0-1.fc17`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nvr {
    pub name: String,
    pub version: String,
    pub release: String,
}

impl Nvr {
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let mut parts = s.trim().rsplitn(3, '-');
        let release = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if name.is_empty() || version.is_empty() || release.is_empty() {
            return Err(StorageError::InvalidNvr(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            release: release.to_string(),
        })
    }
}

impl fmt::Display for Nvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.version, self.release)
    }
}

impl FromStr for Nvr {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Nvr::parse(s)
    }
}

impl TryFrom<String> for Nvr {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Nvr::parse(&s)
    }
}

impl From<Nvr> for String {
    fn from(nvr: Nvr) -> Self {
        nvr.to_string()
    }
}

/// Temporary exception letting an unreleased build into the buildroot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildrootOverride {
    pub nvr: Nvr,
    pub submitter: String,
    #[serde(default)]
    pub expired: bool,
}

/// A single build belonging to one package and one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub nvr: Nvr,
    pub release: String,
    #[serde(default)]
    pub buildroot_override: Option<BuildrootOverride>,
}

impl Build {
    pub fn new(nvr: Nvr, release: impl Into<String>) -> Self {
        Self {
            nvr,
            release: release.into(),
            buildroot_override: None,
        }
    }

    pub fn package(&self) -> &str {
        &self.nvr.name
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Security,
    Bugfix,
    Enhancement,
    Newpackage,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Security => "security",
            UpdateType::Bugfix => "bugfix",
            UpdateType::Enhancement => "enhancement",
            UpdateType::Newpackage => "newpackage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Testing,
    Stable,
    Obsolete,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Testing => "testing",
            UpdateStatus::Stable => "stable",
            UpdateStatus::Obsolete => "obsolete",
        }
    }
}

/// Bug-tracker ticket referenced by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bug {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub security: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// An approved update as handed over by the governance layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Advisory alias, e.g. `FEDORA-2012-0001`.
    pub id: String,
    pub title: String,
    pub update_type: UpdateType,
    #[serde(default)]
    pub description: String,
    pub release: String,
    pub builds: Vec<Build>,
    #[serde(default)]
    pub bugs: Vec<Bug>,
    pub status: UpdateStatus,
    #[serde(default)]
    pub request: Option<RequestType>,
    pub submitter: String,
    /// When the update was last validated for its request; later wins on
    /// build conflicts.
    pub approved_at: DateTime<Utc>,
    /// Push id that staged this update's builds.
    #[serde(default)]
    pub staged_in: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Update {
    pub fn repo_key(&self, request: RequestType) -> RepoKey {
        RepoKey::new(&self.release, request)
    }

    pub fn nvrs(&self) -> impl Iterator<Item = &Nvr> {
        self.builds.iter().map(|b| &b.nvr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvr_parse_splits_on_last_two_dashes() {
        let nvr = Nvr::parse("python-requests-2.0.1-3.fc17").unwrap();
        assert_eq!(nvr.name, "python-requests");
        assert_eq!(nvr.version, "2.0.1");
        assert_eq!(nvr.release, "3.fc17");
        assert_eq!(nvr.to_string(), "python-requests-2.0.1-3.fc17");
    }

    #[test]
    fn test_nvr_parse_rejects_missing_parts() {
        assert!(Nvr::parse("nodashes").is_err());
        assert!(Nvr::parse("name-1.0").is_err());
        assert!(Nvr::parse("-1.0-1").is_err());
    }

    #[test]
    fn test_nvr_serde_as_string() {
        let nvr = Nvr::parse("a-1.0-1").unwrap();
        let json = serde_json::to_string(&nvr).unwrap();
        assert_eq!(json, "\"a-1.0-1\"");
        let back: Nvr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nvr);
        assert!(serde_json::from_str::<Nvr>("\"bogus\"").is_err());
    }

    #[test]
    fn test_repo_key_display_and_parse() {
        let stable = RepoKey::new("f17", RequestType::Stable);
        assert_eq!(stable.release, "F17");
        assert_eq!(stable.to_string(), "f17-updates");

        let testing = RepoKey::new("F17", RequestType::Testing);
        assert_eq!(testing.to_string(), "f17-updates-testing");

        assert_eq!("f17-updates".parse::<RepoKey>().unwrap(), stable);
        assert_eq!("f17-updates-testing".parse::<RepoKey>().unwrap(), testing);
        assert!("f17".parse::<RepoKey>().is_err());
        assert!("-updates".parse::<RepoKey>().is_err());
    }

    #[test]
    fn test_request_type_target_status() {
        assert_eq!(RequestType::Stable.target_status(), UpdateStatus::Stable);
        assert_eq!(RequestType::Testing.target_status(), UpdateStatus::Testing);
        assert_eq!("STABLE".parse::<RequestType>().unwrap(), RequestType::Stable);
        assert!("obsolete".parse::<RequestType>().is_err());
    }
}
