//! Admission and execution of pull request builds.

use bytes::Bytes;
use pullci_core::{
    BuildKey, BuildOutcome, BuildState, Error, MethodResult, PullRequestEvent, Result, TestMethod,
};
use pullci_executor::BuildExecutor;
use pullci_store::{Admission, CoordinationStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

/// Queue name under which execution durations are recorded.
pub const BUILD_QUEUE: &str = "build";

/// What admission did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// First sighting of the commit; its build is on the queue.
    Enqueued,
    /// The commit was already admitted. Nothing was done.
    Duplicate,
}

struct Builds {
    executor: Arc<BuildExecutor>,
    method: TestMethod,
}

/// Ties the store, the queue and the build executor together.
///
/// Admission claims a commit with set-if-absent before anything is
/// enqueued, so the queue never carries a build the store does not know
/// about. Execution commits the outcome in one transaction, so observers see
/// either `pending` or `complete` with its fields.
pub struct PipelineCoordinator {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<dyn WorkQueue>,
    topic: String,
    builds: Option<Builds>,
}

impl PipelineCoordinator {
    /// A coordinator that can admit and retry but not build.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<dyn WorkQueue>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            topic: topic.into(),
            builds: None,
        }
    }

    /// Enable the execution path, building every delivery with `method`.
    pub fn with_builds(mut self, executor: Arc<BuildExecutor>, method: TestMethod) -> Self {
        self.builds = Some(Builds { executor, method });
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Admit a pull request event.
    ///
    /// `raw` is the payload as received, in whatever format it arrived,
    /// and is kept for debugging only. The encoded event is kept separately
    /// for `retry`.
    pub async fn admit(&self, event: &PullRequestEvent, raw: Option<&[u8]>) -> Result<AdmitOutcome> {
        event.validate()?;
        let key = event.key();
        let payload = event.encode()?;

        match self.store.try_set_pending(&key).await? {
            Admission::AlreadySet => {
                debug!(repo = %key.repository, sha = %key.sha, "Commit already admitted");
                self.count("duplicate").await;
                return Ok(AdmitOutcome::Duplicate);
            }
            Admission::Admitted => {}
        }

        if let Err(e) = self.store.save_event(&key, &payload).await {
            warn!(repo = %key.repository, sha = %key.sha, error = %e, "Failed to save event; retry will not be possible");
        }
        if let Some(raw) = raw {
            if let Err(e) = self.store.save_associated_blob(&key, raw).await {
                warn!(repo = %key.repository, sha = %key.sha, error = %e, "Failed to save payload");
            }
        }
        if let Err(e) = self
            .store
            .record_pull_request_commit(&event.repository, event.number, &event.head_sha)
            .await
        {
            warn!(repo = %key.repository, pr = event.number, error = %e, "Failed to record pull request commit");
        }
        self.count("admitted").await;

        match self.queue.publish(&self.topic, Bytes::from(payload)).await {
            Ok(()) => {
                info!(
                    repo = %key.repository,
                    sha = %key.sha,
                    pr = event.number,
                    "Build enqueued"
                );
                Ok(AdmitOutcome::Enqueued)
            }
            Err(e) => {
                error!(
                    repo = %key.repository,
                    sha = %key.sha,
                    orphaned_pending = true,
                    error = %e,
                    "Commit is pending but its build was not enqueued"
                );
                self.count("orphaned").await;
                Err(Error::OrphanedPending {
                    repo: key.repository,
                    sha: key.sha,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run the build carried by one queue message and record its outcome.
    ///
    /// `Error::InvalidInput` means the message can never be processed.
    /// Any other error leaves the commit pending and the message should be
    /// redelivered.
    pub async fn handle_delivery(&self, payload: &[u8]) -> Result<BuildOutcome> {
        let started = Instant::now();
        let result = self.build_and_commit(payload).await;
        if let Err(e) = self
            .store
            .record_duration(BUILD_QUEUE, started.elapsed().as_secs_f64())
            .await
        {
            warn!(error = %e, "Failed to record message duration");
        }
        result
    }

    async fn build_and_commit(&self, payload: &[u8]) -> Result<BuildOutcome> {
        let builds = self
            .builds
            .as_ref()
            .ok_or_else(|| Error::Internal("coordinator has no build executor".to_string()))?;
        let event = PullRequestEvent::decode(payload)?;
        let key = event.key();
        let method = builds.method;
        info!(repo = %key.repository, sha = %key.sha, %method, pr = event.number, "Building");

        let outcome = match builds.executor.execute(&event, method).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    repo = %key.repository,
                    sha = %key.sha,
                    %method,
                    error = %e,
                    "Build did not run; commit stays pending"
                );
                return Err(e);
            }
        };

        let result = MethodResult::new(method, outcome.clone());
        if let Err(e) = self.store.commit_result(&key, &result).await {
            error!(repo = %key.repository, sha = %key.sha, %method, error = %e, "Failed to commit build result");
            return Err(e.into());
        }
        info!(
            repo = %key.repository,
            sha = %key.sha,
            %method,
            outcome = outcome.label(),
            "Build result recorded"
        );
        Ok(outcome)
    }

    /// Enqueue a pending commit's saved event again.
    ///
    /// For commits left pending by a failed enqueue or by builds that kept
    /// failing to set up. Completed commits are not rebuilt this way.
    pub async fn retry(&self, key: &BuildKey) -> Result<()> {
        match self.store.fetch_state(key).await? {
            Some(BuildState::Pending) => {}
            Some(BuildState::Complete) => {
                return Err(Error::Conflict(format!("{} is already complete", key)));
            }
            None => return Err(Error::NotFound(format!("{} was never admitted", key))),
        }

        let saved = self
            .store
            .fetch_event(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no saved event for {}", key)))?;
        let event = PullRequestEvent::decode(&saved)?;
        if event.key() != *key {
            return Err(Error::Conflict(format!(
                "saved event for {} belongs to {}",
                key,
                event.key()
            )));
        }

        self.queue
            .publish(&self.topic, Bytes::from(event.encode()?))
            .await?;
        info!(repo = %key.repository, sha = %key.sha, "Build re-enqueued");
        self.count("retried").await;
        Ok(())
    }

    /// Report a message the queue will not deliver again. Its commit stays
    /// pending until an operator retries it.
    pub async fn abandon(&self, payload: &[u8], error: &Error) {
        let key = PullRequestEvent::decode(payload).ok().map(|event| event.key());
        let (repo, sha) = key
            .map(|key| (key.repository, key.sha))
            .unwrap_or_default();
        error!(
            stuck_pending = true,
            repo = %repo,
            sha = %sha,
            method = ?self.builds.as_ref().map(|b| b.method),
            error = %error,
            "Delivery attempts exhausted; commit stays pending until retried"
        );
        self.count("exhausted").await;
    }

    async fn count(&self, action: &str) {
        if let Err(e) = self.store.increment_counter(action).await {
            warn!(action, error = %e, "Failed to bump counter");
        }
    }
}
