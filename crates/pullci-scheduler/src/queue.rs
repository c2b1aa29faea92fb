//! Work queue contract and an in-memory implementation.
//!
//! Delivery is at-least-once: every message published to a topic reaches
//! one consumer of each consumer group, and a message that is negatively
//! acknowledged comes back to the group.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use pullci_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>>>;

/// One received message.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// How many times this message was delivered before; 0 the first time.
    fn redelivery_count(&self) -> u64;

    /// True when a nak will not bring this message back because the queue
    /// has used up its delivery attempts.
    fn is_final_attempt(&self) -> bool {
        false
    }

    /// The message is done with and must not come back.
    async fn ack(&self) -> Result<()>;

    /// The message was not processed and should be delivered again.
    async fn nak(&self) -> Result<()>;
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Returns once the queue has accepted the message.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Consume `topic` as a member of `group`. Members of one group share
    /// the messages; different groups each see every message.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream>;
}

struct Envelope {
    payload: Bytes,
    redeliveries: u64,
}

struct Group {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[derive(Default)]
struct Topic {
    log: Vec<Bytes>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    nacked: AtomicU64,
    /// Deliveries per message; 0 for no limit.
    max_deliver: AtomicU64,
}

/// In-process queue for tests and single-process runs.
///
/// A group created after messages were published first receives the
/// topic's whole history, like a durable consumer on a fresh stream.
/// With a delivery limit set, a message nak'ed on its last attempt is
/// dropped.
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, Topic>>,
    counters: Arc<Counters>,
    available: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes fail, as if the broker were unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Deliver each message at most `max_deliver` times; 0 removes the limit.
    pub fn set_max_deliver(&self, max_deliver: u64) {
        self.counters.max_deliver.store(max_deliver, Ordering::SeqCst);
    }

    /// Everything ever published to `topic`.
    pub async fn published(&self, topic: &str) -> Vec<Bytes> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    pub fn acked(&self) -> u64 {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> u64 {
        self.counters.nacked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Queue("memory queue marked unavailable".to_string()));
        }
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(topic.to_string()).or_default();
        topic.log.push(payload.clone());
        for group in topic.groups.values() {
            // The receiver lives as long as the group, so this cannot fail.
            let _ = group.tx.send(Envelope {
                payload: payload.clone(),
                redeliveries: 0,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(topic.to_string()).or_default();
        let log = topic.log.clone();
        let group = topic.groups.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            for payload in log {
                let _ = tx.send(Envelope {
                    payload,
                    redeliveries: 0,
                });
            }
            Group {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });

        let state = (group.rx.clone(), group.tx.clone(), self.counters.clone());
        let stream = futures::stream::unfold(state, |(rx, tx, counters)| async move {
            let envelope = rx.lock().await.recv().await?;
            let delivery: Box<dyn Delivery> = Box::new(MemoryDelivery {
                payload: envelope.payload,
                redeliveries: envelope.redeliveries,
                requeue: tx.clone(),
                counters: counters.clone(),
                settled: AtomicBool::new(false),
            });
            Some((Ok(delivery), (rx, tx, counters)))
        });
        Ok(Box::pin(stream))
    }
}

struct MemoryDelivery {
    payload: Bytes,
    redeliveries: u64,
    requeue: mpsc::UnboundedSender<Envelope>,
    counters: Arc<Counters>,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::Queue("delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivery_count(&self) -> u64 {
        self.redeliveries
    }

    fn is_final_attempt(&self) -> bool {
        let max = self.counters.max_deliver.load(Ordering::SeqCst);
        max > 0 && self.redeliveries + 1 >= max
    }

    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.settle()?;
        self.counters.nacked.fetch_add(1, Ordering::SeqCst);
        if self.is_final_attempt() {
            return Ok(());
        }
        self.requeue
            .send(Envelope {
                payload: self.payload.clone(),
                redeliveries: self.redeliveries + 1,
            })
            .map_err(|_| Error::Queue("consumer group is gone".to_string()))
    }
}
