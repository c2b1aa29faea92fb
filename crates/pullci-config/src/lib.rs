//! KDL configuration parsing for pullci.
//!
//! This crate handles parsing of:
//! - The deployment file (`pullci.kdl`)
//! - Human-friendly durations
//! - Build command variable interpolation

pub mod deployment;
pub mod duration;
pub mod error;
pub mod variables;

pub use deployment::{
    DeploymentConfig, ExecutorKind, ExecutorSettings, NatsSettings, WorkerSettings,
    load_deployment, parse_deployment,
};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use variables::{
    GitContext, JobContext, PullRequestContext, VariableContext, VariableContextBuilder,
};
