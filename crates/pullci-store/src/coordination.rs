//! The coordination store contract.

use async_trait::async_trait;
use pullci_core::{BuildKey, BuildResult, BuildState, MethodResult};

use crate::StoreResult;

/// Result of trying to claim a commit at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This caller created the pending state and owns enqueueing.
    Admitted,
    /// Another admission already owns the commit. Not an error.
    AlreadySet,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Linearizable dedup and durable result persistence.
///
/// Implementations must be safe under arbitrary concurrent callers; the
/// atomicity of `try_set_pending` and `commit_result` is the only
/// synchronization the pipeline relies on.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically set the commit's state to `pending` if no state exists.
    async fn try_set_pending(&self, key: &BuildKey) -> StoreResult<Admission>;

    /// Write `complete` and the method's result fields in one transaction.
    /// Fields of other methods on the same commit are left untouched.
    async fn commit_result(&self, key: &BuildKey, result: &MethodResult) -> StoreResult<()>;

    async fn fetch_state(&self, key: &BuildKey) -> StoreResult<Option<BuildState>>;

    async fn fetch_result(&self, key: &BuildKey) -> StoreResult<BuildResult>;

    /// Bump `<ns>/stats/<action>/count`, returning the new value.
    async fn increment_counter(&self, action: &str) -> StoreResult<u64>;

    /// Append a duration sample for a queue.
    async fn record_duration(&self, queue: &str, seconds: f64) -> StoreResult<()>;

    /// Keep the raw inbound payload for debugging. It may be in any format.
    async fn save_associated_blob(&self, key: &BuildKey, blob: &[u8]) -> StoreResult<()>;

    async fn fetch_associated_blob(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>>;

    /// Keep the encoded event so the commit can be enqueued again.
    async fn save_event(&self, key: &BuildKey, event: &[u8]) -> StoreResult<()>;

    async fn fetch_event(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>>;

    /// Remember that a pull request pointed at this commit.
    async fn record_pull_request_commit(
        &self,
        repository: &str,
        number: u64,
        sha: &str,
    ) -> StoreResult<()>;

    async fn pull_request_commits(&self, repository: &str, number: u64)
    -> StoreResult<Vec<String>>;
}
