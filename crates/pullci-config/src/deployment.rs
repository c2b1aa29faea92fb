//! Deployment configuration parsing.
//!
//! One `pullci.kdl` describes where the store and queue live and how a
//! worker runs builds:
//!
//! ```kdl
//! namespace "/pullci"
//! redis "redis://127.0.0.1:6379" {
//!     timeout "5s"
//! }
//! nats "nats://127.0.0.1:4222" {
//!     stream "PULLCI_BUILDS"
//!     topic "builds"
//!     max-deliver 5
//!     publish-timeout "5s"
//! }
//! worker {
//!     method "test"
//!     concurrency 4
//!     build-timeout "30m"
//!     checkout-timeout "10m"
//!     workspace-root "/var/lib/pullci/work"
//! }
//! executor "docker" {
//!     image "dockercore/docker"
//!     privileged #true
//!     setup-timeout "10m"
//!     command "hack/make.sh" "${method}"
//!     env {
//!         DOCKER_GRAPHDRIVER "vfs"
//!     }
//! }
//! ```
//!
//! Every node is optional; missing values fall back to the defaults below.

use crate::{ConfigError, ConfigResult, VariableContextBuilder, parse_duration};
use kdl::{KdlDocument, KdlNode};
use pullci_core::TestMethod;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "/pullci";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_STREAM: &str = "PULLCI_BUILDS";
pub const DEFAULT_TOPIC: &str = "builds";
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELIVER: i64 = 5;
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_COMMAND: [&str; 2] = ["hack/make.sh", "${method}"];

/// Everything a pullci process needs to know about its deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentConfig {
    /// Prefix of every coordination store key.
    pub namespace: String,
    pub redis_url: String,
    /// Bound on every coordination store call.
    pub store_timeout: Duration,
    pub nats: NatsSettings,
    pub worker: WorkerSettings,
    pub executor: ExecutorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NatsSettings {
    pub url: String,
    /// JetStream stream holding build messages.
    pub stream: String,
    /// Subject builds are published on.
    pub topic: String,
    /// Deliveries of one message before the queue gives up on it.
    pub max_deliver: i64,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSettings {
    /// Test method this worker runs; also its consumer group.
    pub method: TestMethod,
    /// Builds run at once.
    pub concurrency: usize,
    /// Bound on the build command, measured from launch.
    pub build_timeout: Duration,
    /// Bound on each git operation of the checkout.
    pub checkout_timeout: Duration,
    /// Directory under which per-build workspaces are created.
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run the command as a local subprocess.
    Process,
    /// Run the command in a Docker container.
    Docker,
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(ExecutorKind::Process),
            "docker" => Ok(ExecutorKind::Docker),
            _ => Err(format!(
                "unknown executor: {} (expected process or docker)",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorSettings {
    pub kind: ExecutorKind,
    /// Container image; required for the docker executor unless
    /// `build_image` is set.
    pub image: Option<String>,
    /// Build the image from the Dockerfile in each checkout.
    pub build_image: bool,
    pub privileged: bool,
    /// Bound on pulling or building the image and starting the container.
    pub setup_timeout: Duration,
    /// Command template, one argv entry per element.
    pub command: Vec<String>,
    /// Extra environment for the build command. Values may use variables.
    pub env: BTreeMap<String, String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            nats: NatsSettings {
                url: DEFAULT_NATS_URL.to_string(),
                stream: DEFAULT_STREAM.to_string(),
                topic: DEFAULT_TOPIC.to_string(),
                max_deliver: DEFAULT_MAX_DELIVER,
                publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            },
            worker: WorkerSettings {
                method: TestMethod::Test,
                concurrency: 1,
                build_timeout: DEFAULT_BUILD_TIMEOUT,
                checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
                workspace_root: std::env::temp_dir().join("pullci"),
            },
            executor: ExecutorSettings {
                kind: ExecutorKind::Process,
                image: None,
                build_image: false,
                privileged: false,
                setup_timeout: DEFAULT_SETUP_TIMEOUT,
                command: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
                env: BTreeMap::new(),
            },
        }
    }
}

/// Read and parse a deployment file.
pub fn load_deployment(path: impl AsRef<Path>) -> ConfigResult<DeploymentConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_deployment(&text)
}

/// Parse a deployment configuration from KDL text.
pub fn parse_deployment(kdl: &str) -> ConfigResult<DeploymentConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = DeploymentConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }
        match name {
            "namespace" => {
                config.namespace = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("namespace value".to_string()))?;
            }
            "redis" => parse_redis(node, &mut config)?,
            "nats" => parse_nats(node, &mut config.nats)?,
            "worker" => parse_worker(node, &mut config.worker)?,
            "executor" => parse_executor(node, &mut config.executor)?,
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

impl DeploymentConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.trim_matches('/').is_empty() {
            return Err(ConfigError::invalid("namespace", "must not be empty"));
        }
        if self.nats.topic.is_empty() {
            return Err(ConfigError::invalid("nats topic", "must not be empty"));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::invalid("redis timeout", "must be positive"));
        }
        if self.nats.max_deliver == 0 || self.nats.max_deliver < -1 {
            return Err(ConfigError::invalid(
                "nats max-deliver",
                "must be at least 1, or -1 for unlimited",
            ));
        }
        if self.nats.publish_timeout.is_zero() {
            return Err(ConfigError::invalid("nats publish-timeout", "must be positive"));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::invalid("worker concurrency", "must be at least 1"));
        }
        if self.worker.build_timeout.is_zero() {
            return Err(ConfigError::invalid("worker build-timeout", "must be positive"));
        }
        if self.worker.checkout_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "worker checkout-timeout",
                "must be positive",
            ));
        }
        if self.executor.command.is_empty() {
            return Err(ConfigError::MissingField("executor command".to_string()));
        }
        match self.executor.kind {
            ExecutorKind::Docker => {
                if self.executor.image.is_none() && !self.executor.build_image {
                    return Err(ConfigError::MissingField(
                        "image for docker executor".to_string(),
                    ));
                }
                if self.executor.setup_timeout.is_zero() {
                    return Err(ConfigError::invalid(
                        "executor setup-timeout",
                        "must be positive",
                    ));
                }
            }
            ExecutorKind::Process => {
                if self.executor.build_image {
                    return Err(ConfigError::invalid(
                        "executor build-image",
                        "only the docker executor builds images",
                    ));
                }
            }
        }

        // Catch typos in the template now rather than on the first build.
        let mut builder = VariableContextBuilder::new();
        for (key, value) in &self.executor.env {
            builder = builder.with_env(key, value);
        }
        let ctx = builder.build();
        for template in self.executor.command.iter().chain(self.executor.env.values()) {
            let unknown = ctx.unresolved(template);
            if !unknown.is_empty() {
                return Err(ConfigError::invalid(
                    "executor command",
                    format!("unknown variables in '{}': {}", template, unknown.join(", ")),
                ));
            }
        }
        Ok(())
    }
}

fn parse_redis(node: &KdlNode, config: &mut DeploymentConfig) -> ConfigResult<()> {
    config.redis_url = required_string(node, "redis url")?;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "timeout" {
                let raw = required_string(child, "redis timeout")?;
                config.store_timeout = parse_duration("redis timeout", &raw)?;
            }
        }
    }
    Ok(())
}

fn parse_nats(node: &KdlNode, nats: &mut NatsSettings) -> ConfigResult<()> {
    if let Some(url) = get_first_string_arg(node) {
        nats.url = url;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "stream" => nats.stream = required_string(child, "nats stream")?,
                "topic" => nats.topic = required_string(child, "nats topic")?,
                "max-deliver" => {
                    let value = get_first_integer_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("nats max-deliver".to_string()))?;
                    nats.max_deliver = i64::try_from(value).map_err(|_| {
                        ConfigError::invalid("nats max-deliver", format!("{} is out of range", value))
                    })?;
                }
                "publish-timeout" => {
                    let raw = required_string(child, "nats publish-timeout")?;
                    nats.publish_timeout = parse_duration("nats publish-timeout", &raw)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_worker(node: &KdlNode, worker: &mut WorkerSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "method" => {
                let method = required_string(child, "worker method")?;
                worker.method = method
                    .parse()
                    .map_err(|e: String| ConfigError::invalid("worker method", e))?;
            }
            "concurrency" => {
                let value = get_first_integer_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("worker concurrency".to_string()))?;
                worker.concurrency = usize::try_from(value).map_err(|_| {
                    ConfigError::invalid("worker concurrency", format!("{} is out of range", value))
                })?;
            }
            "build-timeout" => {
                let raw = required_string(child, "worker build-timeout")?;
                worker.build_timeout = parse_duration("worker build-timeout", &raw)?;
            }
            "checkout-timeout" => {
                let raw = required_string(child, "worker checkout-timeout")?;
                worker.checkout_timeout = parse_duration("worker checkout-timeout", &raw)?;
            }
            "workspace-root" => {
                worker.workspace_root =
                    PathBuf::from(required_string(child, "worker workspace-root")?);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_executor(node: &KdlNode, executor: &mut ExecutorSettings) -> ConfigResult<()> {
    if let Some(kind) = get_first_string_arg(node) {
        executor.kind = kind
            .parse()
            .map_err(|e: String| ConfigError::invalid("executor", e))?;
    }
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "image" => executor.image = Some(required_string(child, "executor image")?),
            "privileged" => {
                executor.privileged = get_first_bool_arg(child).ok_or_else(|| {
                    ConfigError::invalid("executor privileged", "expected #true or #false")
                })?;
            }
            "build-image" => {
                executor.build_image = get_first_bool_arg(child).ok_or_else(|| {
                    ConfigError::invalid("executor build-image", "expected #true or #false")
                })?;
            }
            "setup-timeout" => {
                let raw = required_string(child, "executor setup-timeout")?;
                executor.setup_timeout = parse_duration("executor setup-timeout", &raw)?;
            }
            "command" => executor.command = get_all_string_args(child),
            "env" => {
                if let Some(grandchildren) = child.children() {
                    for gc in grandchildren.nodes() {
                        let key = gc.name().value().to_string();
                        if let Some(val) = get_first_string_arg(gc) {
                            executor.env.insert(key, val);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}
