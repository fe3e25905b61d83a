//! Topic publish/subscribe used between pipeline stages.
//!
//! Stages exchange JSON payloads over two topics: `raw` carries
//! [`RawFetchEvent`](crate::models::RawFetchEvent)s from the task engine to the
//! parse stage, `parsed` carries [`ParsedRecord`](crate::models::ParsedRecord)s
//! from the parse stage to the canonical sink.
//!
//! Production runs on NATS JetStream. Every topic is backed by a stream and
//! each consuming role reads it through a durable pull consumer named after
//! the role, so messages published while a consumer is down wait for it and
//! replicas of one role share the work. Delivery is at-least-once: a message
//! stays owed until it is settled with [`Settlement::Ack`], and
//! [`Settlement::Retry`] or an expired ack deadline sends it again.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::{self, AckKind, consumer::AckPolicy, consumer::pull};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// How long a stream keeps messages nobody has consumed.
const STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Time a consumer has to settle a delivery before it is sent again.
const ACK_WAIT: Duration = Duration::from_secs(60);

/// Redelivery delay after [`Settlement::Retry`].
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Deliveries per message before the server gives up on it.
const MAX_DELIVER: i64 = 20;

/// One message taken off a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    /// Identifies this delivery to [`TopicSubscriber::settle`].
    pub id: u64,
}

/// Outcome reported for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Done with; never deliver it again.
    Ack,
    /// Not handled; deliver it again later.
    Retry,
}

/// Publishes payloads to named topics.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// A live subscription to one topic.
#[async_trait]
pub trait TopicSubscriber: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<Delivery>;

    /// Report what became of `delivery`. A delivery that is never settled is
    /// sent again once its ack deadline passes.
    async fn settle(&mut self, delivery: &Delivery, settlement: Settlement) -> Result<()>;
}

/// Serialize `value` as JSON and publish it to `topic`.
pub async fn publish_json<T>(publisher: &dyn TopicPublisher, topic: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized + Sync,
{
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, Bytes::from(payload)).await
}

/// Stream backing `topic`. Stream names may not contain `.`.
fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect()
}

/// JetStream-backed broker.
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| IngestError::Broker(format!("connect to {url}: {e}")))?;
        debug!(url, "Connected to NATS");
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Create the stream behind `topic` unless it exists. Publishing to a
    /// topic without a stream fails.
    pub async fn ensure_topic(&self, topic: &str) -> Result<jetstream::stream::Stream> {
        let name = stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![topic.to_string()],
                max_age: STREAM_MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(|e| IngestError::Broker(format!("stream {name} for {topic}: {e}")))?;
        debug!(topic, stream = %name, "Stream ready");
        Ok(stream)
    }

    /// Attach to the durable consumer `consumer` of `topic`, creating both the
    /// stream and the consumer on first use. A new consumer starts from the
    /// oldest retained message.
    pub async fn subscribe(&self, topic: &str, consumer: &str) -> Result<NatsSubscription> {
        let stream = self.ensure_topic(topic).await?;
        let durable = stream
            .get_or_create_consumer(
                consumer,
                pull::Config {
                    durable_name: Some(consumer.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: MAX_DELIVER,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| IngestError::Broker(format!("consumer {consumer} on {topic}: {e}")))?;
        let messages = durable
            .messages()
            .await
            .map_err(|e| IngestError::Broker(format!("pull from {topic}: {e}")))?;
        debug!(topic, consumer, "Subscribed");
        Ok(NatsSubscription {
            messages,
            in_flight: HashMap::new(),
            next_id: 0,
        })
    }

    /// Push buffered publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| IngestError::Broker(format!("flush: {e}")))
    }
}

#[async_trait]
impl TopicPublisher for NatsBroker {
    /// Returns once the stream has stored the message.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| IngestError::Broker(format!("publish to {topic}: {e}")))?;
        ack.await
            .map_err(|e| IngestError::Broker(format!("publish ack from {topic}: {e}")))?;
        Ok(())
    }
}

pub struct NatsSubscription {
    messages: pull::Stream,
    in_flight: HashMap<u64, jetstream::Message>,
    next_id: u64,
}

#[async_trait]
impl TopicSubscriber for NatsSubscription {
    async fn next_message(&mut self) -> Option<Delivery> {
        loop {
            match self.messages.next().await? {
                Ok(message) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let delivery = Delivery {
                        topic: message.subject.to_string(),
                        payload: message.payload.clone(),
                        id,
                    };
                    self.in_flight.insert(id, message);
                    return Some(delivery);
                }
                Err(e) => warn!(error = %e, "Pull consumer error"),
            }
        }
    }

    async fn settle(&mut self, delivery: &Delivery, settlement: Settlement) -> Result<()> {
        let Some(message) = self.in_flight.remove(&delivery.id) else {
            return Ok(());
        };
        let kind = match settlement {
            Settlement::Ack => AckKind::Ack,
            Settlement::Retry => AckKind::Nak(Some(RETRY_DELAY)),
        };
        message
            .ack_with(kind)
            .await
            .map_err(|e| IngestError::Broker(format!("settle message on {}: {e}", delivery.topic)))
    }
}
