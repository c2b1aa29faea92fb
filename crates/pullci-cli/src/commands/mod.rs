//! CLI command implementations.

pub mod admit;
pub mod status;
pub mod worker;

use anyhow::{Context, Result};
use pullci_config::{DeploymentConfig, load_deployment};
use pullci_scheduler::NatsQueue;
use pullci_store::RedisStore;
use std::path::Path;
use tracing::info;

/// Connection settings given on the command line or in the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub redis_url: Option<String>,
    pub nats_url: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut DeploymentConfig) {
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if let Some(url) = &self.nats_url {
            config.nats.url = url.clone();
        }
    }
}

/// Load the deployment file, or the defaults when it does not exist.
pub fn load_config(path: &Path, overrides: &Overrides) -> Result<DeploymentConfig> {
    let mut config = if path.exists() {
        load_deployment(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        DeploymentConfig::default()
    };
    overrides.apply(&mut config);
    Ok(config)
}

/// Connect to the coordination store, bounding each call by the configured
/// timeout.
pub async fn connect_store(config: &DeploymentConfig) -> Result<RedisStore> {
    let store = pullci_store::connect(&config.redis_url, &config.namespace)
        .await
        .context("Failed to connect to Redis")?;
    Ok(store.with_op_timeout(config.store_timeout))
}

pub async fn connect_queue(config: &DeploymentConfig) -> Result<NatsQueue> {
    let queue = NatsQueue::connect(
        &config.nats.url,
        &config.nats.stream,
        &[config.nats.topic.as_str()],
    )
    .await
    .context("Failed to connect to NATS")?;
    Ok(queue
        .with_max_deliver(config.nats.max_deliver)
        .with_publish_timeout(config.nats.publish_timeout))
}

pub fn validate(path: &Path) -> Result<()> {
    match load_deployment(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  namespace:   {}", config.namespace);
            println!("  method:      {}", config.worker.method);
            println!("  concurrency: {}", config.worker.concurrency);
            println!("  timeout:     {:?}", config.worker.build_timeout);
            println!("  command:     {}", config.executor.command.join(" "));
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
