//! Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bytes::Bytes;
use futures::StreamExt;
use pullci_core::executor::{Executor, JobExit, JobHandle, JobSpec};
use pullci_core::{Error, JobId, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the checkout is mounted inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Bound on getting a container running when none is configured.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Where the build container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Pull a published image.
    Pull(String),
    /// Build the `Dockerfile` at the root of each checkout. The image is
    /// tagged per job and removed with the container.
    Checkout,
}

impl From<&str> for ImageSource {
    fn from(image: &str) -> Self {
        ImageSource::Pull(image.to_string())
    }
}

impl From<String> for ImageSource {
    fn from(image: String) -> Self {
        ImageSource::Pull(image)
    }
}

/// Runs build commands in a container, with the checkout bind-mounted at
/// [`CONTAINER_WORKSPACE`].
///
/// Preparing the image, creating the container and starting it are bounded
/// together by the setup timeout; the build deadline starts afterwards.
pub struct DockerExecutor {
    docker: Docker,
    image: ImageSource,
    privileged: bool,
    setup_timeout: Duration,
}

impl DockerExecutor {
    /// Create a new DockerExecutor connecting to the local Docker daemon.
    pub fn new(image: impl Into<ImageSource>, privileged: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Setup(format!("failed to connect to docker: {}", e)))?;
        Ok(Self::with_client(docker, image, privileged))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, image: impl Into<ImageSource>, privileged: bool) -> Self {
        Self {
            docker,
            image: image.into(),
            privileged,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    fn container_name(job_id: &JobId) -> String {
        format!("pullci-job-{}", job_id)
    }

    fn image_tag(job_id: &JobId) -> String {
        format!("pullci-build-{}", job_id)
    }

    /// Make the job's image available and return its name.
    async fn prepare_image(&self, spec: &JobSpec) -> Result<String> {
        match &self.image {
            ImageSource::Pull(image) => {
                self.pull_image(image).await;
                Ok(image.clone())
            }
            ImageSource::Checkout => {
                let tag = Self::image_tag(&spec.id);
                self.build_image(&tag, &spec.working_dir).await?;
                Ok(tag)
            }
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()> {
        info!(image = %tag, context = %context_dir.display(), "Building image");
        let dir = context_dir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || archive_context(&dir))
            .await
            .map_err(|e| Error::Internal(format!("build context task failed: {}", e)))?
            .map_err(|e| Error::Setup(format!("failed to archive build context: {}", e)))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context)));
        while let Some(result) = stream.next().await {
            let info =
                result.map_err(|e| Error::Setup(format!("failed to build image: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::Setup(format!("failed to build image: {}", error)));
            }
            if let Some(line) = info.stream {
                debug!(image = %tag, "{}", line.trim_end());
            }
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // A locally built image cannot be pulled; creation below
                // reports a truly missing one.
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    /// Prepare the image, then create and start the container. Returns
    /// the container name.
    async fn launch(&self, spec: &JobSpec) -> Result<String> {
        let container_name = Self::container_name(&spec.id);
        let image = self.prepare_image(spec).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.working_dir.display(),
                CONTAINER_WORKSPACE
            )]),
            privileged: Some(self.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, job = %spec.name, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Setup(format!("failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Setup(format!("failed to start container: {}", e)))?;
        Ok(container_name)
    }

    /// Best-effort removal of whatever a failed launch left behind.
    async fn discard(&self, job_id: &JobId) {
        let teardown = async {
            let container_name = Self::container_name(job_id);
            if let Err(e) = self.remove_container(&container_name).await {
                warn!(container = %container_name, error = %e, "Failed to remove unstarted container");
            }
            if let Err(e) = self.remove_built_image(job_id).await {
                warn!(job = %job_id, error = %e, "Failed to remove built image");
            }
        };
        if tokio::time::timeout(self.setup_timeout, teardown).await.is_err() {
            warn!(job = %job_id, "Timed out removing unstarted container");
        }
    }

    async fn remove_container(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::Internal(format!(
                "failed to remove container: {}",
                e
            ))),
        }
    }

    async fn remove_built_image(&self, job_id: &JobId) -> Result<()> {
        if self.image != ImageSource::Checkout {
            return Ok(());
        }
        let tag = Self::image_tag(job_id);
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(&tag, Some(options), None).await {
            Ok(_) => {
                debug!(image = %tag, "Removed built image");
                Ok(())
            }
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::Internal(format!("failed to remove image {}: {}", tag, e))),
        }
    }
}

/// Tar a checkout for the image build, keeping symlinks as links.
fn archive_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

/// Conflict (not running) and not found are expected when tearing down a
/// container that already exited or was removed.
fn is_gone(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn command_workspace(&self, _working_dir: &Path) -> PathBuf {
        PathBuf::from(CONTAINER_WORKSPACE)
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        match tokio::time::timeout(self.setup_timeout, self.launch(&spec)).await {
            Ok(Ok(container_name)) => Ok(JobHandle {
                id: spec.id,
                executor_id: container_name,
                executor_name: self.name().to_string(),
            }),
            Ok(Err(e)) => {
                self.discard(&spec.id).await;
                Err(e)
            }
            Err(_) => {
                warn!(job = %spec.name, timeout = ?self.setup_timeout, "Container setup timed out");
                self.discard(&spec.id).await;
                Err(Error::Setup(format!(
                    "container setup timed out after {:?}",
                    self.setup_timeout
                )))
            }
        }
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobExit> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self
            .docker
            .wait_container(&handle.executor_id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(JobExit::Exited {
                code: response.status_code as i32,
            }),
            // Bollard reports a nonzero exit as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                Ok(JobExit::Exited { code: code as i32 })
            }
            Some(Err(e)) => Err(Error::Setup(format!(
                "failed to wait for container: {}",
                e
            ))),
            None => Err(Error::Setup(
                "container wait ended without a status".to_string(),
            )),
        }
    }

    async fn kill(&self, handle: &JobHandle) -> Result<()> {
        info!(container = %handle.executor_id, "Killing container");
        match self
            .docker
            .kill_container(&handle.executor_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::Internal(format!("failed to kill container: {}", e))),
        }
    }

    async fn output(&self, handle: &JobHandle) -> Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(&handle.executor_id, Some(options));
        let mut output = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => output.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    return Err(Error::Setup(format!(
                        "failed to read container logs: {}",
                        e
                    )));
                }
            }
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.remove_container(&handle.executor_id).await?;
        self.remove_built_image(&handle.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_unique_per_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        let name = DockerExecutor::container_name(&id1);

        assert!(name.starts_with("pullci-job-"));
        assert_eq!(name, DockerExecutor::container_name(&id1));
        assert_ne!(name, DockerExecutor::container_name(&id2));
    }

    #[test]
    fn test_missing_and_stopped_containers_are_gone() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        let server = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(is_gone(&not_found));
        assert!(is_gone(&conflict));
        assert!(!is_gone(&server));
    }

    #[test]
    fn test_build_context_holds_the_checkout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine:latest\n").unwrap();
        std::fs::create_dir(dir.path().join("hack")).unwrap();
        std::fs::write(dir.path().join("hack/make.sh"), "#!/bin/sh\n").unwrap();

        let context = archive_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(context.as_slice());
        let paths: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().into_owned())
            .collect();

        assert!(paths.iter().any(|p| p.ends_with("Dockerfile")), "{:?}", paths);
        assert!(paths.iter().any(|p| p.ends_with("hack/make.sh")), "{:?}", paths);
    }

    #[tokio::test]
    async fn test_unresponsive_daemon_is_setup_error() {
        // Connections are accepted by the kernel but never answered.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let docker =
            Docker::connect_with_http(&address, 120, bollard::API_DEFAULT_VERSION).unwrap();
        let executor = DockerExecutor::with_client(docker, "alpine:latest", false)
            .with_setup_timeout(Duration::from_millis(200));

        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec {
            id: JobId::new(),
            name: "pr-42-test".to_string(),
            command: vec!["true".to_string()],
            working_dir: dir.path().to_path_buf(),
            scratch_dir: dir.path().to_path_buf(),
            env: Default::default(),
        };

        let started = std::time::Instant::now();
        let err = executor.spawn(spec).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
