//! NATS JetStream work queue.
//!
//! One stream holds the build subject. Each consumer group is a durable pull
//! consumer with explicit acks, so a message a worker never acknowledges is
//! redelivered after `ack_wait`, up to `max_deliver` times.

use async_nats::jetstream::{self, AckKind, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pullci_core::{Error, Result};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::queue::{Delivery, DeliveryStream, WorkQueue};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_DELIVER: i64 = 5;
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(60 * 60);

pub struct NatsQueue {
    jetstream: jetstream::Context,
    stream_name: String,
    publish_timeout: Duration,
    ack_wait: Duration,
    max_deliver: i64,
}

impl NatsQueue {
    /// Connect and make sure the stream exists and carries `subjects`.
    pub async fn connect(url: &str, stream_name: &str, subjects: &[&str]) -> Result<Self> {
        let client = timeout(CONNECT_TIMEOUT, async_nats::connect(url))
            .await
            .map_err(|_| Error::Queue(format!("timed out connecting to {}", url)))?
            .map_err(|e| Error::Queue(format!("failed to connect to {}: {}", url, e)))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(stream::Config {
                name: stream_name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Queue(format!("failed to create stream {}: {}", stream_name, e)))?;
        info!(stream = %stream_name, ?subjects, "Connected to work queue");

        Ok(Self {
            jetstream,
            stream_name: stream_name.to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: DEFAULT_MAX_DELIVER,
        })
    }

    /// How long a delivery may stay unacknowledged before the server sends
    /// it again. Must exceed the longest build.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }
}

#[async_trait]
impl WorkQueue for NatsQueue {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let publish = async {
            self.jetstream
                .publish(topic.to_string(), payload)
                .await?
                .await
        };
        let ack = timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| {
                Error::Queue(format!(
                    "publish to {} not acknowledged within {:?}",
                    topic, self.publish_timeout
                ))
            })?
            .map_err(|e| Error::Queue(format!("failed to publish to {}: {}", topic, e)))?;
        debug!(topic = %topic, stream = %ack.stream, sequence = ack.sequence, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| Error::Queue(format!("stream {}: {}", self.stream_name, e)))?;

        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(
                group,
                consumer::pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: topic.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    max_deliver: self.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Queue(format!("consumer {}: {}", group, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Queue(format!("failed to pull from {}: {}", group, e)))?;
        // An existing durable consumer keeps the limit it was created with.
        let max_deliver = consumer.cached_info().config.max_deliver;
        info!(topic = %topic, group = %group, max_deliver, "Subscribed");

        let deliveries = messages.map(move |message| match message {
            Ok(message) => Ok(Box::new(NatsDelivery {
                message,
                max_deliver,
            }) as Box<dyn Delivery>),
            Err(e) => Err(Error::Queue(format!("failed to receive: {}", e))),
        });
        Ok(Box::pin(deliveries))
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    /// The consumer's delivery limit; -1 for none.
    max_deliver: i64,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn redelivery_count(&self) -> u64 {
        self.message
            .info()
            .map(|info| info.delivered.saturating_sub(1) as u64)
            .unwrap_or(0)
    }

    fn is_final_attempt(&self) -> bool {
        self.max_deliver > 0
            && self
                .message
                .info()
                .map(|info| info.delivered >= self.max_deliver)
                .unwrap_or(false)
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::Queue(format!("ack failed: {}", e)))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| Error::Queue(format!("nak failed: {}", e)))
    }
}
