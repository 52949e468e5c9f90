//! `BuildSystem` over the koji command-line client.

use std::time::Duration;

use async_trait::async_trait;
use masher_state::Nvr;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{BuildSystem, CollabError, CollabResult};

const SERVICE: &str = "koji";

/// Runs `koji` subcommands with a per-call timeout.
#[derive(Debug, Clone)]
pub struct KojiCli {
    program: String,
    timeout: Duration,
}

impl KojiCli {
    pub fn new(program: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_millis(timeout_ms.max(1)),
        }
    }

    async fn run(&self, args: &[&str]) -> CollabResult<String> {
        debug!(program = %self.program, ?args, "running build system command");
        let child = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| CollabError::Timeout {
                service: SERVICE,
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| CollabError::Io(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = format!("{} {} failed: {stderr}", self.program, args.join(" "));
            // koji reports unknown builds/tags with a GenericError; retrying
            // will not change the answer.
            if stderr.contains("No such") || stderr.contains("not tagged") {
                return Err(CollabError::Rejected {
                    service: SERVICE,
                    reason,
                });
            }
            return Err(CollabError::Request {
                service: SERVICE,
                reason,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl BuildSystem for KojiCli {
    async fn build_tags(&self, nvr: &Nvr) -> CollabResult<Vec<String>> {
        let build = format!("--build={nvr}");
        let out = self.run(&["list-tags", &build]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip(self, nvr), fields(nvr = %nvr))]
    async fn move_build(&self, nvr: &Nvr, from_tag: &str, to_tag: &str) -> CollabResult<()> {
        let nvr = nvr.to_string();
        self.run(&["move-build", from_tag, to_tag, &nvr]).await?;
        Ok(())
    }

    #[instrument(skip(self, nvr), fields(nvr = %nvr))]
    async fn tag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()> {
        let nvr = nvr.to_string();
        self.run(&["tag-build", "--nowait", tag, &nvr]).await?;
        Ok(())
    }

    #[instrument(skip(self, nvr), fields(nvr = %nvr))]
    async fn untag_build(&self, nvr: &Nvr, tag: &str) -> CollabResult<()> {
        let nvr = nvr.to_string();
        self.run(&["untag-build", tag, &nvr]).await?;
        Ok(())
    }

    async fn list_overrides(&self, override_tag: &str) -> CollabResult<Vec<Nvr>> {
        let out = self.run(&["list-tagged", "--quiet", override_tag]).await?;
        out.lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|nvr| {
                Nvr::parse(nvr).map_err(|e| CollabError::Rejected {
                    service: SERVICE,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn fake_koji(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn list_overrides_parses_first_column() {
        let dir = tempfile::tempdir().unwrap();
        let koji = fake_koji(
            dir.path(),
            "koji",
            r#"echo "a-1.0-1.fc17        f17-override   alice"
echo "b-2.0-3.fc17        f17-override   bob""#,
        );
        let cli = KojiCli::new(koji.to_string_lossy(), 5_000);
        let nvrs = cli.list_overrides("f17-override").await.unwrap();
        assert_eq!(nvrs.len(), 2);
        assert_eq!(nvrs[1].to_string(), "b-2.0-3.fc17");
    }

    #[tokio::test]
    async fn failing_command_is_transient_unless_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let koji = fake_koji(dir.path(), "koji-flaky", "echo 'connection reset' >&2; exit 1");
        let cli = KojiCli::new(koji.to_string_lossy(), 5_000);
        let nvr = Nvr::parse("a-1.0-1").unwrap();
        let err = cli.move_build(&nvr, "x", "y").await.unwrap_err();
        assert!(matches!(err, CollabError::Request { .. }));

        let koji = fake_koji(dir.path(), "koji-unknown", "echo 'GenericError: No such build' >&2; exit 1");
        let cli = KojiCli::new(koji.to_string_lossy(), 5_000);
        let err = cli.tag_build(&nvr, "x").await.unwrap_err();
        assert!(matches!(err, CollabError::Rejected { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let koji = fake_koji(dir.path(), "koji", "sleep 5");
        let cli = KojiCli::new(koji.to_string_lossy(), 100);
        let nvr = Nvr::parse("a-1.0-1").unwrap();
        let err = cli.build_tags(&nvr).await.unwrap_err();
        assert!(matches!(err, CollabError::Timeout { .. }));
    }
}
