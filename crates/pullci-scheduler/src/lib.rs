//! Build scheduling for pullci.
//!
//! Admission claims a commit in the coordination store and enqueues it;
//! workers pull from the queue, run the build and commit the outcome.
//! The queue is at-least-once, so the execution path is safe to repeat.

pub mod coordinator;
pub mod nats;
pub mod queue;
pub mod worker;

pub use coordinator::{AdmitOutcome, BUILD_QUEUE, PipelineCoordinator};
pub use nats::NatsQueue;
pub use queue::{Delivery, DeliveryStream, MemoryQueue, WorkQueue};
pub use worker::Worker;
