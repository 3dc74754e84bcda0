//! In-process reference transport: a `tokio::sync::mpsc`-backed fan-out per
//! destination. `Ordered` within one subscription (a single task drains one
//! channel) and `Reliable` (sends never silently drop — a full channel
//! backs up the publisher instead of discarding). Used by the integration
//! tests that exercise the coordinator end to end without a broker.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{has_capability, Handler, RawEnvelope, Subscription, Transport, TransportError, TransportResult};
use crate::{ORDERED, RELIABLE};

#[derive(Default)]
pub struct InMemoryTransport {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<RawEnvelope>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn initialize(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn publish(&self, envelope: RawEnvelope, destination: &str) -> TransportResult<()> {
        let Some(senders) = self.subscribers.get(destination) else {
            return Ok(());
        };
        for sender in senders.iter() {
            if sender.send(envelope.clone()).is_err() {
                warn!(destination, "in-memory subscriber channel closed, dropping message");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn Handler>,
    ) -> TransportResult<Box<dyn Subscription>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawEnvelope>();
        self.subscribers
            .entry(destination.to_string())
            .or_default()
            .push(tx.clone());

        let task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = handler.handle(envelope).await {
                    warn!(%error, "in-memory transport handler returned an error");
                }
            }
        });

        Ok(Box::new(InMemorySubscription { task }))
    }

    fn capabilities(&self) -> u8 {
        ORDERED | RELIABLE
    }
}

struct InMemorySubscription {
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn unsubscribe(&self) -> TransportResult<()> {
        self.task.abort();
        Ok(())
    }
}

pub fn assert_ordered_reliable(transport: &InMemoryTransport) -> bool {
    has_capability(transport.capabilities(), ORDERED) && has_capability(transport.capabilities(), RELIABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use wc_ids::{Hop, MessageEnvelope};

    fn test_envelope(payload: serde_json::Value) -> RawEnvelope {
        let first_hop = Hop::current(Uuid::new_v4(), wc_ids::utc_now());
        MessageEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), payload, first_hop)
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _envelope: RawEnvelope) -> TransportResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn published_envelope_reaches_subscriber() {
        let transport = InMemoryTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            count: Arc::clone(&count),
        });

        transport.subscribe("orders", handler).await.unwrap();

        let envelope = test_envelope(serde_json::json!({"order_id": 1}));
        transport.publish(envelope, "orders").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let transport = InMemoryTransport::new();
        let envelope = test_envelope(serde_json::json!({}));
        transport.publish(envelope, "nobody-listening").await.unwrap();
    }

    #[test]
    fn advertises_ordered_and_reliable_only() {
        let transport = InMemoryTransport::new();
        assert!(assert_ordered_reliable(&transport));
        assert!(!has_capability(transport.capabilities(), crate::REQUEST_RESPONSE));
    }
}
