//! Local subprocess executor.

use async_trait::async_trait;
use pullci_core::executor::{Executor, JobExit, JobHandle, JobSpec};
use pullci_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File in the job's scratch directory receiving stdout and stderr.
pub const OUTPUT_FILE: &str = "output.log";

struct RunningJob {
    child: Mutex<Child>,
    /// Process group led by the child; every descendant inherits it.
    pgid: Option<u32>,
    output_path: PathBuf,
}

/// Send SIGKILL to a whole process group. A group with no members left is
/// not an error.
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pgid)
        .map_err(|_| std::io::Error::other(format!("invalid process group {}", pgid)))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Runs build commands as child processes of the worker.
///
/// Stdout and stderr share one capture file, so the recorded output keeps
/// the interleaving the command produced. Each command leads its own
/// process group, and kill and cleanup signal the whole group so that
/// anything the build started in the background goes with it.
#[derive(Default)]
pub struct LocalProcessExecutor {
    jobs: Mutex<HashMap<JobId, Arc<RunningJob>>>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn job(&self, handle: &JobHandle) -> Result<Arc<RunningJob>> {
        self.jobs
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::Setup("empty command".to_string()))?;

        let output_path = spec.scratch_dir.join(OUTPUT_FILE);
        let stdout = std::fs::File::create(&output_path).map_err(|e| {
            Error::Setup(format!(
                "failed to create {}: {}",
                output_path.display(),
                e
            ))
        })?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| Error::Setup(format!("failed to share output file: {}", e)))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| Error::Setup(format!("failed to launch {}: {}", program, e)))?;

        let pgid = child.id();
        let pid = pgid.map(|p| p.to_string()).unwrap_or_default();
        info!(job = %spec.name, pid = %pid, program = %program, "Started process");

        self.jobs.lock().await.insert(
            spec.id,
            Arc::new(RunningJob {
                child: Mutex::new(child),
                pgid,
                output_path,
            }),
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobExit> {
        let job = self.job(handle).await?;
        let mut child = job.child.lock().await;
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Setup(format!("failed to wait for process: {}", e)))?;
        debug!(pid = %handle.executor_id, status = %status, "Process exited");

        Ok(match status.code() {
            Some(code) => JobExit::Exited { code },
            None => JobExit::Signaled,
        })
    }

    async fn kill(&self, handle: &JobHandle) -> Result<()> {
        let job = self.job(handle).await?;
        let mut child = job.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        info!(pid = %handle.executor_id, "Killing process group");
        if let Some(pgid) = job.pgid {
            kill_group(pgid).map_err(|e| {
                Error::Internal(format!("failed to kill process group {}: {}", pgid, e))
            })?;
        }
        // kill() also reaps the child.
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                _ => Err(Error::Internal(format!(
                    "failed to kill process {}: {}",
                    handle.executor_id, e
                ))),
            },
        }
    }

    async fn output(&self, handle: &JobHandle) -> Result<String> {
        let job = self.job(handle).await?;
        let bytes = tokio::fs::read(&job.output_path)
            .await
            .map_err(|e| Error::Setup(format!("failed to read build output: {}", e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        let Some(job) = self.jobs.lock().await.remove(&handle.id) else {
            return Ok(());
        };
        let mut child = job.child.lock().await;
        let running = matches!(child.try_wait(), Ok(None));
        if running {
            warn!(pid = %handle.executor_id, "Process still running at cleanup, killing");
        }
        // The leader may be gone while its background children live on.
        if let Some(pgid) = job.pgid {
            if let Err(e) = kill_group(pgid) {
                warn!(pgid, error = %e, "Failed to kill process group");
            }
        }
        if running {
            if let Err(e) = child.start_kill() {
                warn!(pid = %handle.executor_id, error = %e, "Failed to kill process");
            }
        }
        Ok(())
    }
}
