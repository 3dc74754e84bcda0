//! In-memory accumulation of queued work between flushes. Call sites queue
//! inserts/completions/failures as they happen during normal request
//! processing; a single `flush()` turns the accumulated queue into one
//! `process_work_batch` round trip, mirroring `transactional-outbox`'s
//! `OutboxProcessor::process_batch` batch-then-single-call shape.

use std::sync::Arc;
use uuid::Uuid;
use wc_storage::{
    CoordinatorStore, InboxCompletion, InboxFailure, NewInboxMessage, NewOutboxMessage,
    NewPerspectiveEvent, OutboxCompletion, OutboxFailure, PerspectiveCompletion, StorageResult,
    WorkBatchRequest, WorkBatchResult,
};

/// A batch of queued operations plus the flags asking for new work on
/// flush. Not `Send`-shared: a fresh one is built per unit of work (a
/// received message, a worker-loop tick) and flushed once.
#[derive(Debug, Default)]
pub struct CoordinatorBatch {
    request: WorkBatchRequest,
}

impl CoordinatorBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_outbox_message(&mut self, message: NewOutboxMessage) -> &mut Self {
        self.request.outbox_inserts.push(message);
        self
    }

    pub fn queue_inbox_message(&mut self, message: NewInboxMessage) -> &mut Self {
        self.request.inbox_inserts.push(message);
        self
    }

    pub fn queue_outbox_completion(&mut self, message_id: Uuid, completed_status: i32) -> &mut Self {
        self.request.outbox_completions.push(OutboxCompletion {
            message_id,
            completed_status,
        });
        self
    }

    pub fn queue_outbox_failure(&mut self, failure: OutboxFailure) -> &mut Self {
        self.request.outbox_failures.push(failure);
        self
    }

    pub fn queue_inbox_completion(
        &mut self,
        message_id: Uuid,
        handler_name: impl Into<String>,
        completed_status: i32,
    ) -> &mut Self {
        self.request.inbox_completions.push(InboxCompletion {
            message_id,
            handler_name: handler_name.into(),
            completed_status,
        });
        self
    }

    pub fn queue_inbox_failure(&mut self, failure: InboxFailure) -> &mut Self {
        self.request.inbox_failures.push(failure);
        self
    }

    pub fn queue_perspective_completion(&mut self, completion: PerspectiveCompletion) -> &mut Self {
        self.request.perspective_completions.push(completion);
        self
    }

    pub fn queue_perspective_event(&mut self, event: NewPerspectiveEvent) -> &mut Self {
        self.request.perspective_inserts.push(event);
        self
    }

    pub fn request_outbox_work(&mut self) -> &mut Self {
        self.request.request_outbox_work = true;
        self
    }

    pub fn request_inbox_work(&mut self) -> &mut Self {
        self.request.request_inbox_work = true;
        self
    }

    pub fn request_perspective_work(&mut self) -> &mut Self {
        self.request.request_perspective_work = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        let r = &self.request;
        r.outbox_inserts.is_empty()
            && r.outbox_completions.is_empty()
            && r.outbox_failures.is_empty()
            && r.inbox_inserts.is_empty()
            && r.inbox_completions.is_empty()
            && r.inbox_failures.is_empty()
            && r.perspective_inserts.is_empty()
            && r.perspective_completions.is_empty()
            && !r.request_outbox_work
            && !r.request_inbox_work
            && !r.request_perspective_work
    }

    /// Sends the accumulated queue as one `process_work_batch` call and
    /// consumes the batch; the caller builds a fresh one for the next unit
    /// of work.
    pub async fn flush(
        self,
        store: &Arc<dyn CoordinatorStore>,
        instance_id: Uuid,
        lease_seconds: i64,
        debug_mode: bool,
    ) -> StorageResult<WorkBatchResult> {
        store
            .process_work_batch(instance_id, self.request, lease_seconds, debug_mode)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_batch_reports_empty() {
        let batch = CoordinatorBatch::new();
        assert!(batch.is_empty());
    }

    #[test]
    fn queuing_an_insert_marks_batch_non_empty() {
        let mut batch = CoordinatorBatch::new();
        batch.queue_outbox_message(NewOutboxMessage {
            message_id: Uuid::new_v4(),
            destination: "orders".into(),
            message_type: "OrderPlaced".into(),
            envelope_type: "OrderPlaced".into(),
            event_data: json!({}),
            metadata: json!({}),
            scope: None,
            stream_id: None,
            partition_number: None,
            is_event: true,
        });
        assert!(!batch.is_empty());
    }

    #[test]
    fn request_flags_also_mark_batch_non_empty() {
        let mut batch = CoordinatorBatch::new();
        batch.request_outbox_work();
        assert!(!batch.is_empty());
    }
}
