//! Running one test method for one commit.

use pullci_config::{DeploymentConfig, VariableContextBuilder};
use pullci_core::build::TIMEOUT_MARKER;
use pullci_core::executor::{Executor, JobHandle, JobSpec};
use pullci_core::{BuildOutcome, JobId, PullRequestEvent, Result, TestMethod};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{GitCheckout, SourceCheckout, Workspace};

/// How builds are run on this worker.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub workspace_root: PathBuf,
    /// Bound on the build command, measured from launch.
    pub build_timeout: Duration,
    /// Bound on each checkout git operation.
    pub checkout_timeout: Duration,
    /// Command template, one argv entry per element.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl BuildSettings {
    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self {
            workspace_root: config.worker.workspace_root.clone(),
            build_timeout: config.worker.build_timeout,
            checkout_timeout: config.worker.checkout_timeout,
            command: config.executor.command.clone(),
            env: config.executor.env.clone(),
        }
    }
}

/// Checks out a pull request and runs the build command against it.
///
/// Every call gets its own workspace, removed before `execute` returns.
/// The build command races a deadline; exactly one of the two is acted upon.
pub struct BuildExecutor {
    executor: Arc<dyn Executor>,
    checkout: Arc<dyn SourceCheckout>,
    settings: BuildSettings,
}

impl BuildExecutor {
    /// Use git for checkout, bounded by the configured checkout timeout.
    pub fn new(executor: Arc<dyn Executor>, settings: BuildSettings) -> Self {
        let checkout = Arc::new(GitCheckout::new(settings.checkout_timeout));
        Self::with_checkout(executor, checkout, settings)
    }

    pub fn with_checkout(
        executor: Arc<dyn Executor>,
        checkout: Arc<dyn SourceCheckout>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            executor,
            checkout,
            settings,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Build `event` with `method`.
    ///
    /// A command that runs to completion yields `Succeeded` or `Failed`; one
    /// that outlives the build timeout is killed and yields `TimedOut`.
    /// Checkout and launch failures are `Error::Setup` and produce no
    /// outcome.
    pub async fn execute(
        &self,
        event: &PullRequestEvent,
        method: TestMethod,
    ) -> Result<BuildOutcome> {
        let workspace = Workspace::create(&self.settings.workspace_root, event.number).await?;
        let result = self.execute_in(&workspace, event, method).await;
        workspace.close();
        result
    }

    async fn execute_in(
        &self,
        workspace: &Workspace,
        event: &PullRequestEvent,
        method: TestMethod,
    ) -> Result<BuildOutcome> {
        let source = workspace.source_dir();
        self.checkout.checkout(event, &source).await?;

        let id = JobId::new();
        let name = format!("pr-{}-{}-{}", event.number, method, id.short());

        let mut variables = VariableContextBuilder::for_event(event, method).with_job(
            &name,
            self.executor
                .command_workspace(&source)
                .display()
                .to_string(),
        );
        for (key, value) in &self.settings.env {
            variables = variables.with_env(key, value);
        }
        let variables = variables.build();

        let spec = JobSpec {
            id,
            name: name.clone(),
            command: variables.interpolate_vec(&self.settings.command),
            working_dir: source,
            scratch_dir: workspace.path().to_path_buf(),
            env: variables.interpolate_map(&self.settings.env),
        };

        let handle = self.executor.spawn(spec).await?;
        info!(
            job = %name,
            executor = %handle.executor_name,
            timeout = ?self.settings.build_timeout,
            "Build started"
        );

        let outcome = self.race_deadline(&handle).await;

        if let Err(e) = self.executor.cleanup(&handle).await {
            warn!(job = %name, error = %e, "Failed to clean up job");
        }
        outcome
    }

    async fn race_deadline(&self, handle: &JobHandle) -> Result<BuildOutcome> {
        let deadline = tokio::time::sleep(self.settings.build_timeout);

        tokio::select! {
            exit = self.executor.wait(handle) => {
                let exit = exit?;
                let output = self.executor.output(handle).await?;
                if exit.success() {
                    info!(job = %handle.id, "Build succeeded");
                    Ok(BuildOutcome::Succeeded { output })
                } else {
                    info!(job = %handle.id, exit_code = ?exit.code(), "Build failed");
                    Ok(BuildOutcome::Failed {
                        exit_code: exit.code(),
                        output,
                    })
                }
            }
            _ = deadline => {
                warn!(
                    job = %handle.id,
                    timeout = ?self.settings.build_timeout,
                    "Build timed out, killing"
                );
                if let Err(e) = self.executor.kill(handle).await {
                    error!(job = %handle.id, error = %e, "Failed to kill timed out build");
                }
                let mut output = self.executor.output(handle).await.unwrap_or_else(|e| {
                    warn!(job = %handle.id, error = %e, "No output from timed out build");
                    String::new()
                });
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(TIMEOUT_MARKER);
                Ok(BuildOutcome::TimedOut { output })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalProcessExecutor;
    use crate::testing::{event, upstream_and_fork};
    use async_trait::async_trait;
    use pullci_core::Error;
    use std::path::Path;
    use std::time::Instant;

    /// Creates an empty source dir instead of cloning.
    struct EmptyCheckout;

    #[async_trait]
    impl SourceCheckout for EmptyCheckout {
        async fn checkout(&self, _event: &PullRequestEvent, dir: &Path) -> Result<()> {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Setup(e.to_string()))
        }
    }

    struct FailingCheckout;

    #[async_trait]
    impl SourceCheckout for FailingCheckout {
        async fn checkout(&self, _event: &PullRequestEvent, _dir: &Path) -> Result<()> {
            Err(Error::Setup("clone failed".to_string()))
        }
    }

    fn settings(root: &Path, command: &[&str], timeout: Duration) -> BuildSettings {
        BuildSettings {
            workspace_root: root.to_path_buf(),
            build_timeout: timeout,
            checkout_timeout: Duration::from_secs(30),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    fn runner(root: &Path, command: &[&str], timeout: Duration) -> BuildExecutor {
        BuildExecutor::with_checkout(
            Arc::new(LocalProcessExecutor::new()),
            Arc::new(EmptyCheckout),
            settings(root, command, timeout),
        )
    }

    fn assert_no_workspaces(root: &Path) {
        let left: Vec<_> = std::fs::read_dir(root).unwrap().collect();
        assert!(left.is_empty(), "workspaces left behind: {:?}", left);
    }

    #[tokio::test]
    async fn test_exit_zero_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(
            root.path(),
            &["sh", "-c", "echo running ${method} for ${repo.name}#${pr.number}"],
            Duration::from_secs(30),
        );

        let outcome = runner.execute(&event(), TestMethod::Binary).await.unwrap();
        assert_eq!(
            outcome,
            BuildOutcome::Succeeded {
                output: "running binary for moby/moby#42\n".to_string()
            }
        );
        assert_no_workspaces(root.path());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_verbatim_output() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(
            root.path(),
            &["sh", "-c", "echo '--- FAIL: TestRace'; echo 'stack' >&2; exit 1"],
            Duration::from_secs(30),
        );

        let outcome = runner.execute(&event(), TestMethod::Test).await.unwrap();
        assert_eq!(
            outcome,
            BuildOutcome::Failed {
                exit_code: Some(1),
                output: "--- FAIL: TestRace\nstack\n".to_string()
            }
        );
        assert_no_workspaces(root.path());
    }

    #[tokio::test]
    async fn test_unlaunchable_command_is_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(
            root.path(),
            &["/no/such/make.sh", "${method}"],
            Duration::from_secs(30),
        );

        let err = runner.execute(&event(), TestMethod::Test).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert_no_workspaces(root.path());
    }

    #[tokio::test]
    async fn test_checkout_failure_is_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let runner = BuildExecutor::with_checkout(
            Arc::new(LocalProcessExecutor::new()),
            Arc::new(FailingCheckout),
            settings(root.path(), &["true"], Duration::from_secs(30)),
        );

        let err = runner.execute(&event(), TestMethod::Test).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert_no_workspaces(root.path());
    }

    #[tokio::test]
    async fn test_hung_build_is_killed_at_deadline() {
        let root = tempfile::tempdir().unwrap();
        let timeout = Duration::from_millis(500);
        let runner = runner(
            root.path(),
            &["sh", "-c", "echo started; exec sleep 30"],
            timeout,
        );

        let started = Instant::now();
        let outcome = runner.execute(&event(), TestMethod::Test).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(5), "took {:?}", elapsed);
        match outcome {
            BuildOutcome::TimedOut { output } => {
                assert!(output.starts_with("started\n"));
                assert!(output.ends_with(TIMEOUT_MARKER));
            }
            other => panic!("Expected TimedOut, got {:?}", other),
        }
        assert_no_workspaces(root.path());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timed_out_build_takes_its_background_processes() {
        use crate::testing::{exits_soon, read_pid};

        let root = tempfile::tempdir().unwrap();
        let pids = tempfile::tempdir().unwrap();
        let pid_file = pids.path().join("daemon.pid");
        let script = format!(
            "sleep 30 & echo $! > '{}'; echo started; wait",
            pid_file.display()
        );
        let runner = runner(
            root.path(),
            &["sh", "-c", &script],
            Duration::from_millis(500),
        );

        let outcome = runner.execute(&event(), TestMethod::Test).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::TimedOut { .. }));

        let daemon = read_pid(&pid_file).await;
        assert!(exits_soon(daemon).await, "background sleep {} survived", daemon);
        assert_no_workspaces(root.path());
    }

    #[tokio::test]
    async fn test_env_is_interpolated() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = settings(
            root.path(),
            &["sh", "-c", "echo $BUILD_SHA"],
            Duration::from_secs(30),
        );
        settings
            .env
            .insert("BUILD_SHA".to_string(), "${git.short_sha}".to_string());
        let runner = BuildExecutor::with_checkout(
            Arc::new(LocalProcessExecutor::new()),
            Arc::new(EmptyCheckout),
            settings,
        );

        let outcome = runner.execute(&event(), TestMethod::Test).await.unwrap();
        assert_eq!(outcome.output(), "abc1234\n");
    }

    #[tokio::test]
    async fn test_builds_real_checkout() {
        let repos = tempfile::tempdir().unwrap();
        let event = upstream_and_fork(repos.path());
        let root = tempfile::tempdir().unwrap();
        let runner = BuildExecutor::new(
            Arc::new(LocalProcessExecutor::new()),
            settings(
                root.path(),
                &["sh", "-c", "cat feature.txt; test \"$(pwd)\" = \"${workspace}\""],
                Duration::from_secs(30),
            ),
        );

        let outcome = runner.execute(&event, TestMethod::Test).await.unwrap();
        assert_eq!(
            outcome,
            BuildOutcome::Succeeded {
                output: "from the fork\n".to_string()
            }
        );
        assert_no_workspaces(root.path());
    }
}
