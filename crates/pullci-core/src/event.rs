//! The pull request event carried from admission to execution.
//!
//! Events are decoded and validated once, at the boundary, by
//! [`PullRequestEvent::decode`]. Everything downstream works with the typed
//! record and never looks at raw JSON again.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use url::Url;

use crate::{Error, Result};

static REPO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").unwrap());

static SHA_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{4,64}$").unwrap());

/// One side of a pull request: a branch and where to fetch it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    /// Branch name, e.g. `master` or `some-feature-branch`.
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Clone URL of the repository holding the branch.
    pub clone_url: Url,
}

/// A request to build the head commit of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    /// Repository full name (`owner/name`).
    pub repository: String,
    /// Pull request number.
    pub number: u64,
    /// Branch the pull request targets.
    pub base: BranchRef,
    /// Branch proposed for merging.
    pub head: BranchRef,
    /// Commit at the tip of the head branch. Together with the repository
    /// this is the build key.
    pub head_sha: String,
}

/// Identifies one commit of one repository; the admission and result key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{repository}@{sha}")]
pub struct BuildKey {
    pub repository: String,
    pub sha: String,
}

impl BuildKey {
    pub fn new(repository: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            sha: sha.into(),
        }
    }
}

impl PullRequestEvent {
    /// Decode and validate a serialized event.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let event: PullRequestEvent = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidInput(format!("malformed pull request event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Serialize the event into a queue payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Check every field once so the execution side can trust the record.
    pub fn validate(&self) -> Result<()> {
        if !REPO_REGEX.is_match(&self.repository) {
            return Err(Error::InvalidInput(format!(
                "repository must be owner/name, got '{}'",
                self.repository
            )));
        }
        if !SHA_REGEX.is_match(&self.head_sha) {
            return Err(Error::InvalidInput(format!(
                "head sha must be 4-64 lowercase hex characters, got '{}'",
                self.head_sha
            )));
        }
        validate_ref("base", &self.base.ref_name)?;
        validate_ref("head", &self.head.ref_name)?;
        Ok(())
    }

    pub fn key(&self) -> BuildKey {
        BuildKey::new(self.repository.clone(), self.head_sha.clone())
    }
}

fn validate_ref(side: &str, ref_name: &str) -> Result<()> {
    let invalid = ref_name.is_empty()
        || ref_name.starts_with('-')
        || ref_name.contains("..")
        || ref_name.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(Error::InvalidInput(format!(
            "{} ref '{}' is not a valid branch name",
            side, ref_name
        )));
    }
    Ok(())
}
