//! Executor trait and job types.
//!
//! Executors run one build command for one commit, either as a local
//! subprocess or inside a container. The build runner drives them through
//! spawn, wait (raced against a deadline), kill and cleanup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{JobId, Result};

/// Everything an executor needs to start one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Human-readable name, used for container names and log lines.
    pub name: String,
    /// Program and arguments, already interpolated.
    pub command: Vec<String>,
    /// Checked-out source tree the command runs against.
    pub working_dir: PathBuf,
    /// Per-job scratch directory outside the source tree. Removed together
    /// with the workspace.
    pub scratch_dir: PathBuf,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    /// The job ID.
    pub id: JobId,
    /// Executor-specific identifier (e.g., process id, container name).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// How a job ended, when it ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobExit {
    /// Normal termination with an exit code.
    Exited { code: i32 },
    /// Terminated by a signal, so there is no exit code.
    Signaled,
}

impl JobExit {
    pub fn success(&self) -> bool {
        matches!(self, JobExit::Exited { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            JobExit::Exited { code } => Some(*code),
            JobExit::Signaled => None,
        }
    }
}

/// Trait for job executors.
///
/// Errors from `spawn` and `wait` mean the job could not be launched or
/// observed, and are reported as [`crate::Error::Setup`]. A command that ran
/// and exited nonzero is `Ok(JobExit::Exited { .. })`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Path of the checkout as the command sees it. Container backends
    /// mount the checkout somewhere else.
    fn command_workspace(&self, working_dir: &Path) -> PathBuf {
        working_dir.to_path_buf()
    }

    /// Launch a job. Returns as soon as the job is running.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Wait for a job to exit on its own. Must be cancel safe: the build
    /// runner drops this future when the deadline wins.
    async fn wait(&self, handle: &JobHandle) -> Result<JobExit>;

    /// Forcibly stop a job and reclaim its OS resources. Killing a job that
    /// already exited is not an error.
    async fn kill(&self, handle: &JobHandle) -> Result<()>;

    /// Combined stdout and stderr captured so far.
    async fn output(&self, handle: &JobHandle) -> Result<String>;

    /// Release anything the executor still holds for this job.
    async fn cleanup(&self, handle: &JobHandle) -> Result<()>;
}
