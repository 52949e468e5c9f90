//! MetadataInjector: writes the update advisory document into a composed
//! tree and registers it in the tree's index.
//!
//! The advisory content is a pure function of the push's updates: no clock,
//! no environment. Re-running over the same push yields identical bytes.

use std::path::Path;

use chrono::{DateTime, Utc};
use masher_state::{Nvr, PushRecord, Update, UpdateType};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::compose::{sha256_hex, write_atomic, ComposeError, DataEntry, RepoIndex, REPODATA_DIR};

pub const UPDATEINFO_FILE: &str = "updateinfo.json";
pub const UPDATEINFO_KEY: &str = "updateinfo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub id: String,
    pub update_type: UpdateType,
    pub title: String,
    pub description: String,
    /// When the update was approved for this push.
    pub issued: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    pub builds: Vec<Nvr>,
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub repo: String,
    pub advisories: Vec<Advisory>,
}

fn advisory(update: &Update, bug_url_base: &str) -> Advisory {
    let mut builds: Vec<Nvr> = update.nvrs().cloned().collect();
    builds.sort();
    let mut bugs = update.bugs.clone();
    bugs.sort_by_key(|b| b.id);

    let severity = (update.update_type == UpdateType::Security).then(|| {
        if bugs.iter().any(|b| b.security) {
            "important".to_string()
        } else {
            "moderate".to_string()
        }
    });

    Advisory {
        id: update.id.clone(),
        update_type: update.update_type,
        title: update.title.clone(),
        description: update.description.clone(),
        issued: update.approved_at,
        severity,
        builds,
        references: bugs
            .iter()
            .map(|b| Reference {
                id: b.id.to_string(),
                title: b.title.clone(),
                url: format!("{bug_url_base}{}", b.id),
            })
            .collect(),
    }
}

/// Build the advisory document for a push.
pub fn build_updateinfo(push: &PushRecord, bug_url_base: &str) -> UpdateInfo {
    let mut advisories: Vec<Advisory> = push
        .updates
        .iter()
        .map(|u| advisory(u, bug_url_base))
        .collect();
    advisories.sort_by(|a, b| a.id.cmp(&b.id));
    UpdateInfo {
        repo: push.repo.to_string(),
        advisories,
    }
}

/// Serialized advisory document.
pub fn render_updateinfo(push: &PushRecord, bug_url_base: &str) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(&build_updateinfo(push, bug_url_base))
}

#[derive(Debug, Clone)]
pub struct MetadataInjector {
    bug_url_base: String,
}

impl MetadataInjector {
    pub fn new(bug_url_base: impl Into<String>) -> Self {
        Self {
            bug_url_base: bug_url_base.into(),
        }
    }

    /// Write `repodata/updateinfo.json` and merge it into the tree's index.
    #[instrument(skip_all, fields(push_id = %push.push_id, tree = %tree.display()))]
    pub async fn inject(&self, push: &PushRecord, tree: &Path) -> Result<DataEntry, ComposeError> {
        let bytes = render_updateinfo(push, &self.bug_url_base)
            .map_err(|e| ComposeError::fatal(format!("cannot encode updateinfo: {e}")))?;
        let href = format!("{REPODATA_DIR}/{UPDATEINFO_FILE}");
        write_atomic(&tree.join(&href), &bytes)
            .await
            .map_err(|e| ComposeError::from_io("write updateinfo", e))?;

        let entry = DataEntry {
            href,
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
        };
        let mut index = RepoIndex::load(tree).await?;
        index.data.insert(UPDATEINFO_KEY.to_string(), entry.clone());
        index.store(tree).await?;
        debug!(advisories = push.updates.len(), sha256 = %entry.sha256, "updateinfo injected");
        Ok(entry)
    }
}
