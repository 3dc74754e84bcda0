//! Publisher worker (C6): flushes claimed outbox rows to a [`Transport`],
//! following the teacher's `OutboxProcessor::start()`/`process_batch()`
//! split — an outer poll loop logs a summary per cycle and updates
//! [`WorkerMetrics`], an inner function does the actual publishing and
//! returns a count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wc_coordinator::CoordinatorConfig;
use wc_ids::{Hop, MessageEnvelope};
use wc_storage::{CoordinatorStore, OutboxFailure, OutboxRow, StorageResult, WorkFlags};
use wc_transport::{RawEnvelope, Transport, TransportError};

use crate::metrics::WorkerMetrics;

pub struct PublisherWorker {
    store: Arc<dyn CoordinatorStore>,
    transport: Arc<dyn Transport>,
    instance_id: Uuid,
    config: CoordinatorConfig,
    metrics: WorkerMetrics,
    worker_pool_size: usize,
}

impl PublisherWorker {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        transport: Arc<dyn Transport>,
        instance_id: Uuid,
        config: CoordinatorConfig,
        worker_pool_size: usize,
    ) -> Self {
        let metrics = WorkerMetrics::new("work-coordinator", "publisher");
        Self {
            store,
            transport,
            instance_id,
            config,
            metrics,
            worker_pool_size,
        }
    }

    /// Runs until `cancellation` fires. Returns once in-flight publishes
    /// from the final cycle have drained or `drain_timeout` has elapsed,
    /// whichever comes first.
    pub async fn run(&self, poll_interval: std::time::Duration, cancellation: CancellationToken) {
        info!(poll_interval_secs = poll_interval.as_secs(), "publisher worker starting");

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                result = self.process_batch() => {
                    match result {
                        Ok(count) if count > 0 => info!(published_count = count, "published outbox rows"),
                        Ok(_) => debug!("no outbox work to publish"),
                        Err(error) => error!(%error, "publisher batch failed"),
                    }
                }
            }

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("publisher worker stopped accepting new cycles, draining in-flight work");
    }

    async fn process_batch(&self) -> StorageResult<usize> {
        let start = Instant::now();
        let mut batch = wc_coordinator::CoordinatorBatch::new();
        batch.request_outbox_work();
        let claimed = batch
            .flush(&self.store, self.instance_id, self.config.lease_seconds, self.config.debug_mode)
            .await?;

        self.metrics.claimed_pending.set(claimed.outbox_work.len() as i64);

        if claimed.outbox_work.is_empty() {
            self.metrics.flush_latency.observe(start.elapsed().as_secs_f64());
            return Ok(0);
        }

        let by_stream = group_by_stream(claimed.outbox_work);
        let mut join_set: JoinSet<usize> = JoinSet::new();
        let mut published_total = 0;

        for (_, rows) in by_stream {
            if join_set.len() >= self.worker_pool_size {
                if let Some(result) = join_set.join_next().await {
                    published_total += result.unwrap_or(0);
                }
            }
            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let instance_id = self.instance_id;
            let max_attempts = self.config.max_attempts;
            let metrics = self.metrics.clone();
            let debug_mode = self.config.debug_mode;
            join_set.spawn(async move {
                publish_stream_rows(store, transport, instance_id, max_attempts, &metrics, rows, debug_mode).await
            });
        }

        while let Some(result) = join_set.join_next().await {
            published_total += result.unwrap_or(0);
        }

        self.metrics.flush_latency.observe(start.elapsed().as_secs_f64());
        Ok(published_total)
    }
}

fn group_by_stream(rows: Vec<(OutboxRow, WorkFlags)>) -> Vec<(Option<Uuid>, Vec<OutboxRow>)> {
    let mut order: Vec<Option<Uuid>> = Vec::new();
    let mut groups: HashMap<Option<Uuid>, Vec<OutboxRow>> = HashMap::new();
    for (row, _flags) in rows {
        let key = row.stream_id;
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(row);
    }
    order.into_iter().map(|key| (key, groups.remove(&key).unwrap_or_default())).collect()
}

/// Publishes every row for one stream sequentially, preserving FIFO order
/// within the stream, then flushes the resulting completions/failures in
/// one call.
async fn publish_stream_rows(
    store: Arc<dyn CoordinatorStore>,
    transport: Arc<dyn Transport>,
    instance_id: Uuid,
    max_attempts: i32,
    metrics: &WorkerMetrics,
    rows: Vec<OutboxRow>,
    debug_mode: bool,
) -> usize {
    let mut batch = wc_coordinator::CoordinatorBatch::new();
    let mut published = 0;

    for row in rows {
        match publish_one(&transport, instance_id, &row).await {
            Ok(()) => {
                batch.queue_outbox_completion(
                    row.message_id,
                    wc_storage::status::set_bit(row.status, wc_storage::status::PUBLISHED),
                );
                metrics.published.inc();
                published += 1;
            }
            Err(error) => {
                let (failure_reason, terminal) = classify_failure(&error, row.attempts, max_attempts);
                let mut partial_status = row.status;
                if terminal {
                    partial_status = wc_storage::status::set_bit(partial_status, wc_storage::status::FAILED);
                }
                batch.queue_outbox_failure(OutboxFailure {
                    message_id: row.message_id,
                    partial_status,
                    error: error.to_string(),
                    failure_reason: failure_reason.into(),
                });
                metrics.failed.inc();
                warn!(message_id = %row.message_id, %error, terminal, "outbox publish failed");
            }
        }
    }

    if let Err(error) = batch.flush(&store, instance_id, 300, debug_mode).await {
        error!(%error, "failed to flush publisher completions/failures");
    }

    published
}

/// Every transport call is wrapped in a timeout distinct from the
/// `failure_reason` backoff applied to the row itself — this guards
/// against a publish that never resolves, not against a publish that
/// resolves with an error.
const PUBLISH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn publish_one(
    transport: &Arc<dyn Transport>,
    instance_id: Uuid,
    row: &OutboxRow,
) -> Result<(), TransportError> {
    let envelope = reconstruct_envelope(instance_id, row);
    let destination = row.destination.clone();
    match resilience::with_timeout(PUBLISH_TIMEOUT, transport.publish(envelope, &destination)).await {
        Ok(inner) => inner,
        Err(timeout_error) => Err(TransportError::Other(anyhow::anyhow!(timeout_error))),
    }
}

fn reconstruct_envelope(instance_id: Uuid, row: &OutboxRow) -> RawEnvelope {
    let mut hop = Hop::current(instance_id, wc_ids::utc_now()).with_topic(row.message_type.clone());
    if let Some(stream_id) = row.stream_id {
        hop = hop.with_stream_key(stream_id.to_string());
    }
    if let Some(partition_number) = row.partition_number {
        hop = hop.with_partition(partition_number);
    }
    for (key, value) in row.metadata.as_object().into_iter().flatten() {
        hop = hop.with_metadata(key.clone(), value.clone());
    }
    MessageEnvelope::new(row.message_id, row.message_id, row.event_data.clone(), hop)
}

/// `(reason, terminal)` — `terminal` means the row should be marked
/// permanently `Failed` rather than left retryable.
fn classify_failure(error: &TransportError, attempts_so_far: i32, max_attempts: i32) -> (wc_storage::FailureReason, bool) {
    use wc_storage::FailureReason;

    let reason = match error {
        TransportError::NotReady => FailureReason::TransportNotReady,
        TransportError::PublishFailed(_) => FailureReason::TransportException,
        _ => FailureReason::Unknown,
    };

    let next_attempts = if reason.consumes_attempt() { attempts_so_far + 1 } else { attempts_so_far };
    if next_attempts >= max_attempts {
        (FailureReason::MaxAttemptsExceeded, true)
    } else {
        (reason, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_not_ready_does_not_count_toward_max_attempts() {
        let (reason, terminal) = classify_failure(&TransportError::NotReady, 9, 10);
        assert_eq!(reason, wc_storage::FailureReason::TransportNotReady);
        assert!(!terminal);
    }

    #[test]
    fn exhausting_attempts_marks_terminal() {
        let (reason, terminal) = classify_failure(&TransportError::PublishFailed("boom".into()), 9, 10);
        assert_eq!(reason, wc_storage::FailureReason::MaxAttemptsExceeded);
        assert!(terminal);
    }

    #[test]
    fn group_by_stream_preserves_first_seen_order() {
        let stream_a = Uuid::new_v4();
        let stream_b = Uuid::new_v4();
        let make_row = |stream: Option<Uuid>| OutboxRow {
            message_id: Uuid::new_v4(),
            destination: "d".into(),
            message_type: "t".into(),
            envelope_type: "t".into(),
            event_data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: stream,
            partition_number: None,
            is_event: false,
            status: 0,
            attempts: 0,
            error: None,
            failure_reason: 0,
            instance_id: None,
            lease_expiry: None,
            scheduled_for: None,
            created_at: wc_ids::utc_now(),
            published_at: None,
            processed_at: None,
        };

        let rows = vec![
            (make_row(Some(stream_a)), WorkFlags::NewlyStored),
            (make_row(Some(stream_b)), WorkFlags::NewlyStored),
            (make_row(Some(stream_a)), WorkFlags::NewlyStored),
        ];

        let grouped = group_by_stream(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, Some(stream_a));
        assert_eq!(grouped[0].1.len(), 2);
        assert_eq!(grouped[1].0, Some(stream_b));
    }
}
