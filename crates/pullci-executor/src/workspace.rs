//! Per-build scratch directories.

use pullci_core::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// A uniquely named directory for one build.
///
/// Holds the checkout under `src/` and executor scratch files next to it.
/// Dropping the workspace removes it; [`Workspace::close`] does the same but
/// logs a failed removal.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root`, creating `root` if needed.
    pub async fn create(root: &Path, number: u64) -> Result<Self> {
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            Error::Setup(format!(
                "failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("pr-{}-", number))
            .tempdir_in(root)
            .map_err(|e| Error::Setup(format!("failed to create workspace: {}", e)))?;
        debug!(path = %dir.path().display(), "Created workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the repository is checked out. Not created until checkout.
    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspaces_are_unique_and_removed() {
        let root = tempfile::tempdir().unwrap();

        let first = Workspace::create(root.path(), 7).await.unwrap();
        let second = Workspace::create(root.path(), 7).await.unwrap();
        assert_ne!(first.path(), second.path());
        assert!(
            first
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("pr-7-")
        );
        assert_eq!(first.source_dir(), first.path().join("src"));

        std::fs::write(first.path().join("output.log"), "x").unwrap();
        let first_path = first.path().to_path_buf();
        first.close();
        assert!(!first_path.exists());

        let second_path = second.path().to_path_buf();
        drop(second);
        assert!(!second_path.exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b");

        let workspace = Workspace::create(&nested, 1).await.unwrap();
        assert!(workspace.path().starts_with(&nested));
    }
}
