//! Source checkout for a pull request.

use async_trait::async_trait;
use pullci_core::{Error, PullRequestEvent, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Produces the source tree a build runs against.
#[async_trait]
pub trait SourceCheckout: Send + Sync {
    /// Populate `dir` (which must not exist yet) with the pull request's
    /// code. Any failure is [`Error::Setup`].
    async fn checkout(&self, event: &PullRequestEvent, dir: &Path) -> Result<()>;
}

/// Clones the base branch and pulls the head branch on top, so the build
/// sees the result of merging the pull request.
pub struct GitCheckout {
    timeout: Duration,
}

impl GitCheckout {
    /// Each git invocation is killed after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git<I, S>(&self, cwd: Option<&Path>, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        debug!(command = ?cmd.as_std(), "Running git");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Setup(format!("failed to run git: {}", e))),
            Err(_) => {
                warn!(timeout = ?self.timeout, "Git timed out");
                return Err(Error::Setup(format!(
                    "git did not finish within {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "Git failed");
            return Err(Error::Setup(format!(
                "git exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceCheckout for GitCheckout {
    async fn checkout(&self, event: &PullRequestEvent, dir: &Path) -> Result<()> {
        info!(
            repo = %event.repository,
            base = %event.base.ref_name,
            path = %dir.display(),
            "Cloning base branch"
        );
        self.git(
            None,
            [
                OsStr::new("clone"),
                OsStr::new("-q"),
                OsStr::new("-b"),
                OsStr::new(&event.base.ref_name),
                OsStr::new(event.base.clone_url.as_str()),
                dir.as_os_str(),
            ],
        )
        .await?;

        info!(
            head = %event.head.ref_name,
            head_url = %event.head.clone_url,
            "Pulling head branch"
        );
        self.git(
            Some(dir),
            [
                "-c",
                "user.name=pullci",
                "-c",
                "user.email=pullci@localhost",
                "pull",
                "-q",
                "--no-rebase",
                event.head.clone_url.as_str(),
                event.head.ref_name.as_str(),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{commit_file, git, upstream_and_fork};

    #[tokio::test]
    async fn test_checkout_merges_head_onto_base() {
        let root = tempfile::tempdir().unwrap();
        let event = upstream_and_fork(root.path());
        let dir = root.path().join("checkout");

        GitCheckout::new(Duration::from_secs(30))
            .checkout(&event, &dir)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.join("feature.txt")).unwrap(),
            "from the fork\n"
        );
        assert_eq!(git(&dir, &["rev-parse", "HEAD"]), event.head_sha);
    }

    #[tokio::test]
    async fn test_diverged_base_is_merged() {
        let root = tempfile::tempdir().unwrap();
        let event = upstream_and_fork(root.path());
        let upstream = event.base.clone_url.to_file_path().unwrap();
        commit_file(&upstream, "later.txt", "base moved on\n", "later");
        let dir = root.path().join("checkout");

        GitCheckout::new(Duration::from_secs(30))
            .checkout(&event, &dir)
            .await
            .unwrap();

        assert!(dir.join("later.txt").exists());
        assert!(dir.join("feature.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_base_branch_is_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let mut event = upstream_and_fork(root.path());
        event.base.ref_name = "no-such-branch".to_string();

        let err = GitCheckout::new(Duration::from_secs(30))
            .checkout(&event, &root.path().join("checkout"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }

    #[tokio::test]
    async fn test_missing_head_branch_is_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let mut event = upstream_and_fork(root.path());
        event.head.ref_name = "gone".to_string();

        let err = GitCheckout::new(Duration::from_secs(30))
            .checkout(&event, &root.path().join("checkout"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }
}
