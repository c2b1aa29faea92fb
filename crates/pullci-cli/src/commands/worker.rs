//! Long-running build worker.

use anyhow::{Context, Result};
use pullci_config::{DeploymentConfig, ExecutorKind};
use pullci_core::executor::Executor;
use pullci_executor::{
    BuildExecutor, BuildSettings, DockerExecutor, ImageSource, LocalProcessExecutor,
};
use pullci_scheduler::{PipelineCoordinator, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

const ACK_WAIT_SLACK: Duration = Duration::from_secs(60);

/// How long the queue waits for an acknowledgement before redelivering.
///
/// A build is one clone and one pull, each bounded by the checkout timeout,
/// then container setup when builds run in Docker, then the command bounded
/// by the build timeout.
pub fn ack_wait(config: &DeploymentConfig) -> Duration {
    let setup = match config.executor.kind {
        ExecutorKind::Process => Duration::ZERO,
        ExecutorKind::Docker => config.executor.setup_timeout,
    };
    config.worker.build_timeout + config.worker.checkout_timeout * 2 + setup + ACK_WAIT_SLACK
}

fn executor(config: &DeploymentConfig) -> Result<Arc<dyn Executor>> {
    Ok(match config.executor.kind {
        ExecutorKind::Process => Arc::new(LocalProcessExecutor::new()),
        ExecutorKind::Docker => {
            let image = if config.executor.build_image {
                ImageSource::Checkout
            } else {
                config
                    .executor
                    .image
                    .clone()
                    .context("The docker executor needs an image")?
                    .into()
            };
            Arc::new(
                DockerExecutor::new(image, config.executor.privileged)
                    .context("Failed to connect to Docker")?
                    .with_setup_timeout(config.executor.setup_timeout),
            )
        }
    })
}

pub async fn run(config: &DeploymentConfig, id: Option<String>) -> Result<()> {
    let method = config.worker.method;
    let id = id.unwrap_or_else(|| format!("{}-{}", method, std::process::id()));

    info!(redis = %config.redis_url, "Connecting to coordination store");
    let store = super::connect_store(config).await?;

    info!(nats = %config.nats.url, "Connecting to work queue");
    let queue = super::connect_queue(config)
        .await?
        .with_ack_wait(ack_wait(config));
    let queue = Arc::new(queue);

    let builds = BuildExecutor::new(executor(config)?, BuildSettings::from_config(config));
    tokio::fs::create_dir_all(&builds.settings().workspace_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create workspace root {}",
                builds.settings().workspace_root.display()
            )
        })?;

    let coordinator = PipelineCoordinator::new(Arc::new(store), queue.clone(), &config.nats.topic)
        .with_builds(Arc::new(builds), method);
    let worker = Worker::new(id, Arc::new(coordinator), queue, method.as_str())
        .with_concurrency(config.worker.concurrency);

    worker.run(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = shutdown_signal_io().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, finishing running builds");
}

async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
