//! Worker that consumes build deliveries from the queue.

use crate::coordinator::PipelineCoordinator;
use crate::queue::{Delivery, WorkQueue};
use futures::StreamExt;
use pullci_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// A member of one consumer group, running up to `concurrency` builds at
/// once.
pub struct Worker {
    id: String,
    coordinator: Arc<PipelineCoordinator>,
    queue: Arc<dyn WorkQueue>,
    group: String,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        coordinator: Arc<PipelineCoordinator>,
        queue: Arc<dyn WorkQueue>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            coordinator,
            queue,
            group: group.into(),
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run the worker loop until `shutdown` resolves.
    ///
    /// On shutdown no new delivery is taken; builds already running finish
    /// and settle their deliveries before this returns.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let topic = self.coordinator.topic().to_string();
        let mut deliveries = self.queue.subscribe(&topic, &self.group).await?;
        info!(
            worker_id = %self.id,
            topic = %topic,
            group = %self.group,
            concurrency = self.concurrency,
            "Starting worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| Error::Internal(format!("worker semaphore closed: {}", e)))?,
            };

            let next = tokio::select! {
                _ = &mut shutdown => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let coordinator = self.coordinator.clone();
                    let worker_id = self.id.clone();
                    tasks.spawn(async move {
                        settle(&worker_id, &coordinator, delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to receive delivery");
                    sleep(Duration::from_secs(1)).await;
                }
                None => {
                    warn!(worker_id = %self.id, "Delivery stream ended");
                    break;
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.id, error = %e, "Build task panicked");
                }
            }
        }

        if !tasks.is_empty() {
            info!(worker_id = %self.id, running = tasks.len(), "Draining running builds");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %self.id, error = %e, "Build task panicked");
            }
        }
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }
}

/// Process one delivery and acknowledge or reject it.
///
/// Undecodable messages are acknowledged so they do not come back. Anything
/// else that went wrong is rejected for redelivery; the commit stays pending.
/// A rejection on the last delivery attempt is reported as abandoned.
async fn settle(worker_id: &str, coordinator: &PipelineCoordinator, delivery: Box<dyn Delivery>) {
    let redeliveries = delivery.redelivery_count();
    let settled = match coordinator.handle_delivery(delivery.payload()).await {
        Ok(outcome) => {
            info!(worker_id, outcome = outcome.label(), redeliveries, "Delivery processed");
            delivery.ack().await
        }
        Err(Error::InvalidInput(message)) => {
            error!(worker_id, redeliveries, %message, "Dropping undecodable delivery");
            delivery.ack().await
        }
        Err(e) => {
            if delivery.is_final_attempt() {
                coordinator.abandon(delivery.payload(), &e).await;
            } else {
                warn!(worker_id, redeliveries, error = %e, "Delivery failed, requeueing");
            }
            delivery.nak().await
        }
    };
    if let Err(e) = settled {
        warn!(worker_id, error = %e, "Failed to settle delivery");
    }
}
