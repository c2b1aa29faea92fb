//! Core domain types and traits for the pullci build pipeline.
//!
//! This crate contains:
//! - The pull request event that flows from admission to execution
//! - Build keys, states, outcomes and per-method results
//! - The executor trait implemented by process and container backends
//! - Job identifiers and the shared error type

pub mod build;
pub mod error;
pub mod event;
pub mod executor;
pub mod id;

pub use build::{BuildOutcome, BuildResult, BuildState, MethodResult, TestMethod};
pub use error::{Error, Result};
pub use event::{BranchRef, BuildKey, PullRequestEvent};
pub use id::JobId;
