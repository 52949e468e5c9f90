//! `UpdateStore` over a JSON export of the governance service's updates.
//!
//! The file holds `{ "updates": [ ... ] }`. Every mutation rewrites it
//! through a temp file and rename so readers never see a partial file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use masher_state::{Comment, PushId, RequestType, Update, UpdateStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CollabError, CollabResult, UpdateStore};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateExport {
    #[serde(default)]
    pub updates: Vec<Update>,
}

impl UpdateExport {
    /// Approved for `request`, not obsolete and not already published there.
    pub fn eligible(&self, request: RequestType) -> Vec<Update> {
        self.updates
            .iter()
            .filter(|u| u.request == Some(request))
            .filter(|u| u.status != UpdateStatus::Obsolete)
            .filter(|u| u.status != request.target_status())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> CollabResult<&Update> {
        self.updates
            .iter()
            .find(|u| u.id == id)
            .ok_or_else(|| CollabError::NotFound(format!("update {id}")))
    }

    pub fn get_mut(&mut self, id: &str) -> CollabResult<&mut Update> {
        self.updates
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| CollabError::NotFound(format!("update {id}")))
    }

    pub fn set_status(&mut self, id: &str, status: UpdateStatus) -> CollabResult<()> {
        let update = self.get_mut(id)?;
        update.status = status;
        update.request = None;
        Ok(())
    }
}

pub struct JsonUpdateStore {
    path: PathBuf,
    export: Mutex<UpdateExport>,
}

impl JsonUpdateStore {
    /// Load the export at `path`; a missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> CollabResult<Self> {
        let path = path.as_ref().to_path_buf();
        let export = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| CollabError::Rejected {
                service: "update-store",
                reason: format!("{}: {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UpdateExport::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), updates = export.updates.len(), "update export loaded");
        Ok(Self {
            path,
            export: Mutex::new(export),
        })
    }

    async fn persist(&self, export: &UpdateExport) -> CollabResult<()> {
        let bytes = serde_json::to_vec_pretty(export).map_err(|e| CollabError::Rejected {
            service: "update-store",
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> CollabResult<()>
    where
        F: FnOnce(&mut UpdateExport) -> CollabResult<()> + Send,
    {
        let mut export = self.export.lock().await;
        f(&mut export)?;
        self.persist(&export).await
    }
}

#[async_trait]
impl UpdateStore for JsonUpdateStore {
    async fn eligible_updates(&self, request: RequestType) -> CollabResult<Vec<Update>> {
        Ok(self.export.lock().await.eligible(request))
    }

    async fn get_update(&self, id: &str) -> CollabResult<Update> {
        self.export.lock().await.get(id).cloned()
    }

    async fn mark_staged(&self, id: &str, push_id: &PushId) -> CollabResult<()> {
        self.mutate(|e| {
            e.get_mut(id)?.staged_in = Some(push_id.to_string());
            Ok(())
        })
        .await
    }

    async fn set_status(&self, id: &str, status: UpdateStatus) -> CollabResult<()> {
        self.mutate(|e| e.set_status(id, status)).await
    }

    async fn add_comment(&self, id: &str, comment: Comment) -> CollabResult<()> {
        self.mutate(|e| {
            e.get_mut(id)?.comments.push(comment);
            Ok(())
        })
        .await
    }
}
