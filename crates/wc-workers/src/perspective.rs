//! Perspective runner (C8): projects events onto read models one
//! `perspective_events` row at a time, following the same load-apply-store
//! shape `event-store::EventStore` uses for aggregates, but keyed by
//! `(stream_id, perspective_name)` instead of `aggregate_id` alone.
//!
//! `event-store::EventStore` has no "load one event by id" method — only
//! whole-stream and whole-log reads. Rather than add one to that crate,
//! [`EventReader`] wraps it and finds the matching event client-side; the
//! event log for one stream is expected to be small enough that this is a
//! non-issue in practice.

use std::sync::Arc;

use async_trait::async_trait;
use event_store::{Event, EventStore};
use tracing::warn;
use uuid::Uuid;
use wc_coordinator::CoordinatorBatch;
use wc_storage::{CoordinatorStore, PerspectiveCompletion, ReadModelStore};

use crate::metrics::WorkerMetrics;

#[derive(Debug, thiserror::Error)]
pub enum EventReaderError {
    #[error("event store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("event {event_id} not found in stream {stream_id}")]
    NotFound { stream_id: Uuid, event_id: Uuid },
}

/// Loads one event by id out of a stream's full history. A thin adapter
/// over [`EventStore`], not a replacement for it.
#[async_trait]
pub trait EventReader: Send + Sync {
    async fn load_event(&self, stream_id: Uuid, event_id: Uuid) -> Result<Event, EventReaderError>;
}

pub struct EventStoreReader<S: EventStore> {
    store: S,
}

impl<S: EventStore> EventStoreReader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: EventStore> EventReader for EventStoreReader<S> {
    async fn load_event(&self, stream_id: Uuid, event_id: Uuid) -> Result<Event, EventReaderError> {
        let events = self.store.load_events(&stream_id.to_string()).await?;
        events
            .into_iter()
            .find(|e| e.event_id == event_id)
            .ok_or(EventReaderError::NotFound { stream_id, event_id })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("projection failed: {0}")]
    Failed(String),
}

/// One perspective's fold: given the current read model (`None` if this is
/// the stream's first event for this perspective) and the next event,
/// produce the new model. Pure — no I/O, no awareness of checkpoints.
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;
    fn apply(
        &self,
        model: Option<serde_json::Value>,
        event: &Event,
    ) -> Result<serde_json::Value, ProjectionError>;
}

pub struct PerspectiveRunner<R: EventReader> {
    store: Arc<dyn CoordinatorStore>,
    read_models: Arc<dyn ReadModelStore>,
    event_reader: Arc<R>,
    instance_id: Uuid,
    lease_seconds: i64,
    projection: Arc<dyn Projection>,
    metrics: WorkerMetrics,
    debug_mode: bool,
}

impl<R: EventReader> PerspectiveRunner<R> {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        read_models: Arc<dyn ReadModelStore>,
        event_reader: Arc<R>,
        instance_id: Uuid,
        lease_seconds: i64,
        projection: Arc<dyn Projection>,
        debug_mode: bool,
    ) -> Self {
        let metrics = WorkerMetrics::new("work-coordinator", "perspective");
        Self {
            store,
            read_models,
            event_reader,
            instance_id,
            lease_seconds,
            projection,
            metrics,
            debug_mode,
        }
    }

    pub async fn process_batch(&self) -> wc_storage::StorageResult<usize> {
        let mut batch = CoordinatorBatch::new();
        batch.request_perspective_work();
        let claimed = batch
            .flush(&self.store, self.instance_id, self.lease_seconds, self.debug_mode)
            .await?;

        if claimed.perspective_work.is_empty() {
            return Ok(0);
        }

        self.metrics.claimed_pending.set(claimed.perspective_work.len() as i64);

        let mut completion_batch = CoordinatorBatch::new();
        let mut processed = 0;

        for (row, _flags) in claimed.perspective_work {
            if row.perspective_name != self.projection.name() {
                continue;
            }
            match self.project_one(&row).await {
                Ok(()) => {
                    completion_batch.queue_perspective_completion(PerspectiveCompletion {
                        stream_id: row.stream_id,
                        perspective_name: row.perspective_name.clone(),
                        event_id: row.event_id,
                        status: wc_storage::status::STORED,
                        error: None,
                    });
                    self.metrics.published.inc();
                    processed += 1;
                }
                Err(error) => {
                    completion_batch.queue_perspective_completion(PerspectiveCompletion {
                        stream_id: row.stream_id,
                        perspective_name: row.perspective_name.clone(),
                        event_id: row.event_id,
                        status: wc_storage::status::set_bit(row.status, wc_storage::status::CATCHING_UP),
                        error: Some(error.to_string()),
                    });
                    self.metrics.failed.inc();
                    warn!(
                        stream_id = %row.stream_id,
                        perspective = %row.perspective_name,
                        event_id = %row.event_id,
                        %error,
                        "projection failed, row remains claimable after lease expiry",
                    );
                }
            }
        }

        completion_batch
            .flush(&self.store, self.instance_id, self.lease_seconds, self.debug_mode)
            .await?;

        Ok(processed)
    }

    async fn project_one(&self, row: &wc_storage::PerspectiveEventRow) -> Result<(), ProjectionError> {
        let event = self
            .event_reader
            .load_event(row.stream_id, row.event_id)
            .await
            .map_err(|e| ProjectionError::Failed(e.to_string()))?;

        let existing = self
            .read_models
            .load_read_model(&row.perspective_name, row.stream_id)
            .await
            .map_err(|e| ProjectionError::Failed(e.to_string()))?;

        let next_version = existing.as_ref().map(|m| m.version + 1).unwrap_or(1);
        let model = self.projection.apply(existing.map(|m| m.data), &event)?;

        self.read_models
            .upsert_read_model(&row.perspective_name, row.stream_id, next_version, model)
            .await
            .map_err(|e| ProjectionError::Failed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DoublingCounter;

    impl Projection for DoublingCounter {
        fn name(&self) -> &str {
            "counter"
        }

        fn apply(
            &self,
            model: Option<serde_json::Value>,
            _event: &Event,
        ) -> Result<serde_json::Value, ProjectionError> {
            let current = model.and_then(|v| v.get("count").and_then(|c| c.as_i64())).unwrap_or(0);
            Ok(serde_json::json!({ "count": current + 1 }))
        }
    }

    #[test]
    fn projection_starts_from_zero_when_no_prior_model() {
        let projection = DoublingCounter;
        let event = Event::new("stream-1", "Incremented", 1, serde_json::json!({}));
        let result = projection.apply(None, &event).unwrap();
        assert_eq!(result["count"], 1);
    }

    #[test]
    fn projection_folds_on_existing_model() {
        let projection = DoublingCounter;
        let event = Event::new("stream-1", "Incremented", 2, serde_json::json!({}));
        let result = projection.apply(Some(serde_json::json!({"count": 4})), &event).unwrap();
        assert_eq!(result["count"], 5);
    }

    #[tokio::test]
    async fn event_reader_reports_not_found_for_missing_event() {
        struct EmptyStore;

        #[async_trait]
        impl EventStore for EmptyStore {
            async fn append_events(
                &self,
                _aggregate_id: &str,
                _expected_version: i64,
                _events: Vec<Event>,
            ) -> anyhow::Result<()> {
                Ok(())
            }

            async fn load_events(&self, _aggregate_id: &str) -> anyhow::Result<Vec<Event>> {
                Ok(vec![])
            }

            async fn load_events_after(
                &self,
                _aggregate_id: &str,
                _after_version: i64,
            ) -> anyhow::Result<Vec<Event>> {
                Ok(vec![])
            }

            async fn get_all_events(&self, _after_sequence: i64, _limit: i64) -> anyhow::Result<Vec<Event>> {
                Ok(vec![])
            }
        }

        let reader = EventStoreReader::new(EmptyStore);
        let stream_id = Uuid::new_v4();
        let event_id = Uuid::new_v4();
        let result = reader.load_event(stream_id, event_id).await;
        assert!(matches!(result, Err(EventReaderError::NotFound { .. })));
    }
}
