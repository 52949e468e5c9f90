//! PublishSwitcher: the public pointer `<publish_root>/<repo>` is a symlink
//! to exactly one compose directory.
//!
//! Switching creates a temporary symlink next to the pointer and renames it
//! over the old one; `rename(2)` replaces the link atomically, so a reader
//! resolves either the old target or the new one, never neither. Old
//! composes are retained until [`PublishSwitcher::prune`] is called.

use std::io;
use std::path::{Path, PathBuf};

use masher_state::{PushId, RepoKey};
use tracing::{info, instrument, warn};

use crate::compose::is_compose_of;
use crate::error::{MashError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switched {
    /// Target before the switch, if the pointer existed.
    pub previous: Option<PathBuf>,
    /// False when the pointer already resolved to the target.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct PublishSwitcher {
    publish_root: PathBuf,
    compose_root: PathBuf,
}

impl PublishSwitcher {
    pub fn new(publish_root: impl Into<PathBuf>, compose_root: impl Into<PathBuf>) -> Self {
        Self {
            publish_root: publish_root.into(),
            compose_root: compose_root.into(),
        }
    }

    pub fn pointer(&self, repo: &RepoKey) -> PathBuf {
        self.publish_root.join(repo.to_string())
    }

    /// Where the pointer currently resolves, or `None` if never published.
    pub async fn current(&self, repo: &RepoKey) -> Result<Option<PathBuf>> {
        match tokio::fs::read_link(self.pointer(repo)).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `repo` at `target`. Re-running with the same target is a no-op.
    #[instrument(skip(self), fields(repo = %repo, target = %target.display()))]
    pub async fn switch(&self, repo: &RepoKey, target: &Path) -> Result<Switched> {
        if !tokio::fs::metadata(target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(MashError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("compose {} does not exist", target.display()),
            )));
        }

        let previous = self.current(repo).await?;
        if previous.as_deref() == Some(target) {
            info!("pointer already at target");
            return Ok(Switched {
                previous,
                changed: false,
            });
        }

        tokio::fs::create_dir_all(&self.publish_root).await?;
        let pointer = self.pointer(repo);
        let tmp = self
            .publish_root
            .join(format!(".{repo}.{}.tmp", uuid::Uuid::new_v4().simple()));
        symlink(target, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &pointer).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(previous = ?previous, "published");
        Ok(Switched {
            previous,
            changed: true,
        })
    }

    /// Compose directories of `repo`, oldest first.
    pub async fn composes(&self, repo: &RepoKey) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.compose_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_compose_of(repo, name) && entry.file_type().await?.is_dir() {
                out.push(entry.path());
            }
        }
        // Names embed a sortable UTC timestamp.
        out.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(out)
    }

    /// Delete all but the newest `keep` composes of `repo`. Neither the
    /// published target nor any compose written by `in_flight` (the push
    /// holding the repository lock) is deleted. Returns what was removed.
    #[instrument(skip(self, in_flight), fields(repo = %repo, in_flight = ?in_flight.map(PushId::short)))]
    pub async fn prune(
        &self,
        repo: &RepoKey,
        keep: usize,
        in_flight: Option<&PushId>,
    ) -> Result<Vec<PathBuf>> {
        let current = self.current(repo).await?;
        let composes = self.composes(repo).await?;
        let cutoff = composes.len().saturating_sub(keep);
        let in_flight_suffix = in_flight.map(|id| format!("-{}", id.short()));

        let mut removed = Vec::new();
        for path in composes.into_iter().take(cutoff) {
            if current.as_deref() == Some(path.as_path()) {
                continue;
            }
            if let Some(suffix) = &in_flight_suffix {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if name.ends_with(suffix.as_str()) {
                    info!(path = %path.display(), "keeping compose of in-flight push");
                    continue;
                }
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "could not prune compose"),
            }
        }
        info!(removed = removed.len(), "pruned composes");
        Ok(removed)
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use masher_state::RequestType;

    fn repo() -> RepoKey {
        RepoKey::new("F17", RequestType::Stable)
    }

    #[tokio::test]
    async fn switch_is_idempotent_and_tracks_previous() {
        let dir = tempfile::tempdir().unwrap();
        let switcher = PublishSwitcher::new(dir.path().join("pub"), dir.path().join("c"));
        let a = dir.path().join("c/f17-updates-20120601.000000-aaaaaaaa");
        let b = dir.path().join("c/f17-updates-20120602.000000-bbbbbbbb");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        assert_eq!(switcher.current(&repo()).await.unwrap(), None);
        let first = switcher.switch(&repo(), &a).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.previous, None);

        let again = switcher.switch(&repo(), &a).await.unwrap();
        assert!(!again.changed);

        let second = switcher.switch(&repo(), &b).await.unwrap();
        assert_eq!(second.previous.as_deref(), Some(a.as_path()));
        assert_eq!(switcher.current(&repo()).await.unwrap(), Some(b.clone()));
        assert!(a.exists());
    }

    #[tokio::test]
    async fn switch_to_missing_compose_leaves_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let switcher = PublishSwitcher::new(dir.path().join("pub"), dir.path().join("c"));
        let a = dir.path().join("c/f17-updates-20120601.000000-aaaaaaaa");
        std::fs::create_dir_all(&a).unwrap();
        switcher.switch(&repo(), &a).await.unwrap();

        let missing = dir.path().join("c/nope");
        assert!(switcher.switch(&repo(), &missing).await.is_err());
        assert_eq!(switcher.current(&repo()).await.unwrap(), Some(a));
    }
}
