//! Build execution for pullci.
//!
//! Provides:
//! - Per-build workspaces that are removed on every exit path
//! - Git checkout of a pull request merged onto its base branch
//! - Executor backends: local subprocess and Docker container
//! - [`BuildExecutor`], which runs one test method for one commit under a
//!   deadline and classifies the outcome

pub mod build;
pub mod checkout;
pub mod docker;
pub mod process;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use build::{BuildExecutor, BuildSettings};
pub use checkout::{GitCheckout, SourceCheckout};
pub use docker::{DockerExecutor, ImageSource};
pub use process::LocalProcessExecutor;
pub use pullci_core::executor::{Executor, JobExit, JobHandle, JobSpec};
pub use workspace::Workspace;
