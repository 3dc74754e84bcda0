//! Consumer worker (C7): subscribes to a [`Transport`] destination and,
//! for each delivered envelope, drives it through an explicit
//! [`ConsumerScope`] rather than a DI-container resolution — the scope owns
//! everything the receptor invocation needs and is disposed only by
//! sequential `await`s, never by `Drop`, so ordering between "receptor ran"
//! and "scope torn down" is part of the code path instead of incidental.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;
use wc_coordinator::CoordinatorBatch;
use wc_storage::{CoordinatorStore, InboxFailure};
use wc_transport::{Handler, RawEnvelope, TransportError, TransportResult};

use crate::metrics::WorkerMetrics;

#[derive(Debug, thiserror::Error)]
pub enum ReceptorError {
    #[error("receptor failed: {0}")]
    Failed(String),
}

/// The external collaborator invoked once an envelope's inbox row is newly
/// stored (i.e. not a duplicate redelivery).
#[async_trait]
pub trait Receptor: Send + Sync {
    fn handler_name(&self) -> &str;
    async fn receive(&self, envelope: &RawEnvelope) -> Result<Vec<wc_storage::NewOutboxMessage>, ReceptorError>;

    /// Perspectives that should see every event this receptor stores. A
    /// `perspective_events` row is queued for each on a successful receive.
    fn perspective_names(&self) -> &[String] {
        &[]
    }
}

/// Everything one envelope's processing needs: the envelope itself, a fresh
/// batch to queue operations onto, and the store to flush through.
/// Constructed per delivered envelope, consumed by the end of
/// [`ConsumerWorker::handle_envelope`] — there is no reuse across messages.
pub struct ConsumerScope {
    envelope: RawEnvelope,
    batch: CoordinatorBatch,
    store: Arc<dyn CoordinatorStore>,
}

impl ConsumerScope {
    fn new(envelope: RawEnvelope, store: Arc<dyn CoordinatorStore>) -> Self {
        Self {
            envelope,
            batch: CoordinatorBatch::new(),
            store,
        }
    }
}

pub struct ConsumerWorker {
    store: Arc<dyn CoordinatorStore>,
    instance_id: Uuid,
    lease_seconds: i64,
    receptor: Arc<dyn Receptor>,
    metrics: WorkerMetrics,
    debug_mode: bool,
}

impl ConsumerWorker {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        instance_id: Uuid,
        lease_seconds: i64,
        receptor: Arc<dyn Receptor>,
        debug_mode: bool,
    ) -> Self {
        let metrics = WorkerMetrics::new("work-coordinator", "consumer");
        Self {
            store,
            instance_id,
            lease_seconds,
            receptor,
            metrics,
            debug_mode,
        }
    }

    pub fn as_transport_handler(self: Arc<Self>) -> Arc<dyn Handler> {
        self
    }

    async fn handle_envelope(&self, envelope: RawEnvelope) -> TransportResult<()> {
        let mut scope = ConsumerScope::new(envelope, Arc::clone(&self.store));

        scope.batch.queue_inbox_message(wc_storage::NewInboxMessage {
            message_id: scope.envelope.message_id,
            handler_name: self.receptor.handler_name().to_string(),
            destination: scope
                .envelope
                .current_topic()
                .unwrap_or_default()
                .to_string(),
            message_type: scope.envelope.current_topic().unwrap_or_default().to_string(),
            envelope_type: scope.envelope.current_topic().unwrap_or_default().to_string(),
            event_data: scope.envelope.payload.clone(),
            metadata: serde_json::to_value(scope.envelope.get_all_metadata()).unwrap_or_default(),
            scope: None,
            stream_id: scope
                .envelope
                .current_stream_key()
                .and_then(|s| s.parse().ok()),
            partition_number: scope.envelope.current_partition(),
        });

        let batch = std::mem::replace(&mut scope.batch, CoordinatorBatch::new());
        let claimed = batch
            .flush(&scope.store, self.instance_id, self.lease_seconds, self.debug_mode)
            .await
            .map_err(storage_to_transport_error)?;

        if claimed.inbox_work.is_empty() {
            // Already stored: a duplicate redelivery. Acknowledge without
            // invoking the receptor or any perspective hook.
            return Ok(());
        }

        let receive_result = self.receptor.receive(&scope.envelope).await;

        let mut completion_batch = CoordinatorBatch::new();
        match receive_result {
            Ok(produced_outbox_rows) => {
                completion_batch.queue_inbox_completion(
                    scope.envelope.message_id,
                    self.receptor.handler_name(),
                    wc_storage::status::STORED | wc_storage::status::EVENT_STORED,
                );
                for row in produced_outbox_rows {
                    completion_batch.queue_outbox_message(row);
                }
                if let Some(stream_id) = scope.envelope.current_stream_key().and_then(|s| s.parse::<Uuid>().ok()) {
                    for perspective_name in self.receptor.perspective_names() {
                        completion_batch.queue_perspective_event(wc_storage::NewPerspectiveEvent {
                            stream_id,
                            perspective_name: perspective_name.clone(),
                            event_id: scope.envelope.message_id,
                            sequence_number: scope.envelope.current_sequence().unwrap_or(0),
                            partition_number: scope.envelope.current_partition(),
                        });
                    }
                }
                self.metrics.published.inc();
            }
            Err(error) => {
                completion_batch.queue_inbox_failure(InboxFailure {
                    message_id: scope.envelope.message_id,
                    handler_name: self.receptor.handler_name().to_string(),
                    partial_status: wc_storage::status::STORED,
                    error: error.to_string(),
                    failure_reason: wc_storage::FailureReason::ValidationError.into(),
                });
                self.metrics.failed.inc();
                warn!(message_id = %scope.envelope.message_id, %error, "receptor invocation failed");
            }
        }

        let result = completion_batch
            .flush(&scope.store, self.instance_id, self.lease_seconds, self.debug_mode)
            .await;

        // `scope` is dropped here, after both flushes and the receptor
        // invocation have completed — disposal order is this sequencing,
        // not an impl of `Drop`.
        drop(scope);

        result.map(|_| ()).map_err(storage_to_transport_error)
    }
}

#[async_trait]
impl Handler for ConsumerWorker {
    async fn handle(&self, envelope: RawEnvelope) -> TransportResult<()> {
        self.handle_envelope(envelope).await
    }
}

fn storage_to_transport_error(error: wc_storage::StorageError) -> TransportError {
    TransportError::Other(anyhow::anyhow!(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopReceptor;

    #[async_trait]
    impl Receptor for NoopReceptor {
        fn handler_name(&self) -> &str {
            "noop"
        }

        async fn receive(&self, _envelope: &RawEnvelope) -> Result<Vec<wc_storage::NewOutboxMessage>, ReceptorError> {
            Ok(vec![])
        }
    }

    #[test]
    fn receptor_error_message_is_preserved() {
        let error = ReceptorError::Failed("db unavailable".to_string());
        assert!(error.to_string().contains("db unavailable"));
    }
}
