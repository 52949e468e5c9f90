//! SanityChecker: the gate between a composed tree and publication.
//!
//! Checks only; never repairs.

use std::collections::BTreeSet;
use std::path::Path;

use masher_state::{Nvr, PushRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::compose::{sha256_hex, RepoIndex};
use crate::updateinfo::UPDATEINFO_KEY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityReport {
    pub passed: bool,
    /// First problem found, when `passed` is false.
    pub reason: Option<String>,
    pub checked_packages: usize,
}

impl SanityReport {
    fn pass(checked_packages: usize) -> Self {
        Self {
            passed: true,
            reason: None,
            checked_packages,
        }
    }

    fn fail(checked_packages: usize, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            checked_packages,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SanityChecker;

impl SanityChecker {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip_all, fields(push_id = %push.push_id, tree = %tree.display()))]
    pub async fn check(&self, push: &PushRecord, tree: &Path) -> SanityReport {
        let report = Self::inspect(push, tree).await;
        match &report.reason {
            None => info!(packages = report.checked_packages, "sanity check passed"),
            Some(reason) => warn!(%reason, "sanity check failed"),
        }
        report
    }

    async fn inspect(push: &PushRecord, tree: &Path) -> SanityReport {
        let index = match RepoIndex::load(tree).await {
            Ok(index) => index,
            Err(e) => return SanityReport::fail(0, format!("index unreadable: {e}")),
        };
        if index.repo != push.repo.to_string() {
            return SanityReport::fail(
                0,
                format!("index is for {}, expected {}", index.repo, push.repo),
            );
        }

        let planned: BTreeSet<&Nvr> = push.builds().map(|b| &b.nvr).collect();
        let present: BTreeSet<&Nvr> = index.packages.iter().map(|p| &p.nvr).collect();
        if present.len() != planned.len() {
            return SanityReport::fail(
                0,
                format!(
                    "expected {} builds in the index, found {}",
                    planned.len(),
                    present.len()
                ),
            );
        }
        if let Some(missing) = planned.iter().find(|nvr| !present.contains(*nvr)) {
            return SanityReport::fail(0, format!("{missing} is missing from the index"));
        }

        let mut checked = 0;
        for package in &index.packages {
            let path = tree.join(&package.href);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return SanityReport::fail(checked, format!("{}: {e}", package.href))
                }
            };
            if bytes.is_empty() {
                return SanityReport::fail(checked, format!("{} is zero bytes", package.href));
            }
            if bytes.len() as u64 != package.size || sha256_hex(&bytes) != package.sha256 {
                return SanityReport::fail(
                    checked,
                    format!("{} does not match its index entry", package.href),
                );
            }
            checked += 1;
        }

        let Some(entry) = index.data.get(UPDATEINFO_KEY) else {
            return SanityReport::fail(checked, "index has no updateinfo entry");
        };
        match tokio::fs::read(tree.join(&entry.href)).await {
            Ok(bytes) if sha256_hex(&bytes) == entry.sha256 => {}
            Ok(_) => {
                return SanityReport::fail(checked, "updateinfo does not match its checksum")
            }
            Err(e) => return SanityReport::fail(checked, format!("{}: {e}", entry.href)),
        }

        SanityReport::pass(checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{PackageEntry, PACKAGES_DIR, REPODATA_DIR};
    use crate::updateinfo::MetadataInjector;
    use chrono::Utc;
    use masher_state::{Build, PushId, RepoKey, RequestType, Update, UpdateStatus, UpdateType};
    use std::collections::BTreeMap;

    fn push() -> PushRecord {
        PushRecord::new(
            PushId("p".to_string()),
            RepoKey::new("F17", RequestType::Stable),
            vec![Update {
                id: "U1".to_string(),
                title: "t".to_string(),
                update_type: UpdateType::Bugfix,
                description: String::new(),
                release: "F17".to_string(),
                builds: vec![
                    Build::new(Nvr::parse("a-1.0-1").unwrap(), "F17"),
                    Build::new(Nvr::parse("b-2.0-1").unwrap(), "F17"),
                ],
                bugs: Vec::new(),
                status: UpdateStatus::Testing,
                request: Some(RequestType::Stable),
                submitter: "alice".to_string(),
                approved_at: Utc::now(),
                staged_in: None,
                comments: Vec::new(),
            }],
        )
    }

    async fn tree(dir: &Path, packages: &[(&str, &str)]) {
        std::fs::create_dir_all(dir.join(PACKAGES_DIR)).unwrap();
        let mut entries = Vec::new();
        for (nvr, body) in packages {
            let href = format!("{PACKAGES_DIR}/{nvr}.rpm");
            std::fs::write(dir.join(&href), body.as_bytes()).unwrap();
            entries.push(PackageEntry {
                nvr: Nvr::parse(nvr).unwrap(),
                href,
                sha256: sha256_hex(body.as_bytes()),
                size: body.len() as u64,
            });
        }
        RepoIndex {
            repo: "f17-updates".to_string(),
            packages: entries,
            data: BTreeMap::new(),
        }
        .store(dir)
        .await
        .unwrap();
        MetadataInjector::new("").inject(&push(), dir).await.unwrap();
    }

    #[tokio::test]
    async fn complete_tree_passes() {
        let dir = tempfile::tempdir().unwrap();
        tree(dir.path(), &[("a-1.0-1", "a"), ("b-2.0-1", "b")]).await;
        let report = SanityChecker::new().check(&push(), dir.path()).await;
        assert!(report.passed, "{report:?}");
        assert_eq!(report.checked_packages, 2);
    }

    #[tokio::test]
    async fn missing_build_fails() {
        let dir = tempfile::tempdir().unwrap();
        tree(dir.path(), &[("a-1.0-1", "a")]).await;
        let report = SanityChecker::new().check(&push(), dir.path()).await;
        assert!(!report.passed);
        assert!(report.reason.unwrap().contains("expected 2 builds"));
    }

    #[tokio::test]
    async fn zero_byte_package_fails() {
        let dir = tempfile::tempdir().unwrap();
        tree(dir.path(), &[("a-1.0-1", "a"), ("b-2.0-1", "")]).await;
        let report = SanityChecker::new().check(&push(), dir.path()).await;
        assert!(!report.passed);
        assert!(report.reason.unwrap().contains("zero bytes"));
    }

    #[tokio::test]
    async fn tampered_updateinfo_fails() {
        let dir = tempfile::tempdir().unwrap();
        tree(dir.path(), &[("a-1.0-1", "a"), ("b-2.0-1", "b")]).await;
        std::fs::write(dir.path().join(REPODATA_DIR).join("updateinfo.json"), b"{}").unwrap();
        let report = SanityChecker::new().check(&push(), dir.path()).await;
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn unparseable_index_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(REPODATA_DIR)).unwrap();
        std::fs::write(RepoIndex::path(dir.path()), b"not json").unwrap();
        let report = SanityChecker::new().check(&push(), dir.path()).await;
        assert!(!report.passed);
        assert!(report.reason.unwrap().contains("index unreadable"));
    }
}
