//! `rdkafka`-backed transport, built the way `transactional-outbox`'s
//! `KafkaOutboxPublisher` is: topic-per-aggregate routing
//! (`event_type.split('.').next()`), idempotent producer settings, envelope
//! metadata carried as headers. Advertises `PublishSubscribe|Ordered`, not
//! `RequestResponse` — callers needing request/response over this transport
//! go through [`crate::request_response::RequestResponseStore`] instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{Handler, RawEnvelope, Subscription, Transport, TransportError, TransportResult};
use crate::{ORDERED, PUBLISH_SUBSCRIBE};

pub struct KafkaTransport {
    producer: FutureProducer,
    brokers: String,
    consumer_group: String,
    topic_prefix: String,
}

impl KafkaTransport {
    /// `producer` must be configured with `enable.idempotence = true`,
    /// `acks = all`, and `max.in.flight.requests.per.connection <= 5`
    /// exactly as `KafkaOutboxPublisher::new`'s docs require.
    pub fn new(producer: FutureProducer, brokers: impl Into<String>, consumer_group: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            producer,
            brokers: brokers.into(),
            consumer_group: consumer_group.into(),
            topic_prefix: topic_prefix.into(),
        }
    }

    fn topic_for(&self, destination: &str) -> String {
        let aggregate = destination.split('.').next().unwrap_or("unknown");
        format!("{}.{}.events", self.topic_prefix, aggregate)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn initialize(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn publish(&self, envelope: RawEnvelope, destination: &str) -> TransportResult<()> {
        let topic = self.topic_for(destination);
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        let message_id = envelope.message_id.to_string();
        let correlation_id = envelope.correlation_id.to_string();
        let stream_key = envelope.current_stream_key().map(str::to_string);

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "message_id",
                value: Some(message_id.as_bytes()),
            })
            .insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_bytes()),
            });

        let key = stream_key.unwrap_or_else(|| message_id.clone());
        let record = FutureRecord::to(&topic).key(&key).payload(&payload).headers(headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| TransportError::PublishFailed(format!("kafka publish failed: {err}")))?;

        info!(topic = %topic, %message_id, "published envelope to kafka");
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn Handler>,
    ) -> TransportResult<Box<dyn Subscription>> {
        let topic = self.topic_for(destination);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        consumer
            .subscribe(&[&topic])
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        let Some(payload) = message.payload() else {
                            continue;
                        };
                        match serde_json::from_slice::<RawEnvelope>(payload) {
                            Ok(envelope) => {
                                if let Err(error) = handler.handle(envelope).await {
                                    warn!(%error, "kafka transport handler returned an error");
                                }
                            }
                            Err(error) => {
                                error!(%error, "failed to deserialize kafka message as an envelope");
                            }
                        }
                    }
                    Err(error) => {
                        error!(%error, "kafka consumer poll failed");
                    }
                }
            }
        });

        Ok(Box::new(KafkaSubscription { task }))
    }

    fn capabilities(&self) -> u8 {
        PUBLISH_SUBSCRIBE | ORDERED
    }
}

struct KafkaSubscription {
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn unsubscribe(&self) -> TransportResult<()> {
        self.task.abort();
        Ok(())
    }
}
