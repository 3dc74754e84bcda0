//! Fallback for transports that don't advertise `REQUEST_RESPONSE`:
//! correlate a reply to its request by `correlation_id`, waiting with an
//! expiry rather than blocking forever on a reply that never arrives.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{RawEnvelope, TransportError, TransportResult};

#[derive(Default)]
pub struct RequestResponseStore {
    pending: DashMap<Uuid, oneshot::Sender<RawEnvelope>>,
}

impl RequestResponseStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a correlation id and waits up to `timeout` for a matching
    /// reply delivered via [`Self::fulfill`].
    pub async fn wait_for(&self, correlation_id: Uuid, timeout: Duration) -> TransportResult<RawEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(&correlation_id);

        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(TransportError::RequestTimedOut),
            Err(_) => Err(TransportError::RequestTimedOut),
        }
    }

    /// Called by a subscription handler on the reply destination when an
    /// envelope's `correlation_id` matches a pending request. A reply with
    /// no matching (already-expired or never-registered) waiter is dropped.
    pub fn fulfill(&self, correlation_id: Uuid, envelope: RawEnvelope) -> bool {
        if let Some((_, sender)) = self.pending.remove(&correlation_id) {
            sender.send(envelope).is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wc_ids::{Hop, MessageEnvelope};

    fn test_envelope(correlation_id: Uuid) -> RawEnvelope {
        let first_hop = Hop::current(Uuid::new_v4(), wc_ids::utc_now());
        MessageEnvelope::new(Uuid::new_v4(), correlation_id, serde_json::json!({}), first_hop)
    }

    #[tokio::test]
    async fn fulfilled_reply_resolves_the_wait() {
        let store = RequestResponseStore::new();
        let correlation_id = Uuid::new_v4();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_for(correlation_id, Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.fulfill(correlation_id, test_envelope(correlation_id)));

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unfulfilled_reply_times_out() {
        let store = RequestResponseStore::new();
        let correlation_id = Uuid::new_v4();
        let result = store.wait_for(correlation_id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::RequestTimedOut)));
    }

    #[tokio::test]
    async fn fulfilling_an_unknown_correlation_id_is_a_no_op() {
        let store = RequestResponseStore::new();
        assert!(!store.fulfill(Uuid::new_v4(), test_envelope(Uuid::new_v4())));
    }
}
