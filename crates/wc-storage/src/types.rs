use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::status::WorkFlags;

/// A new outbox row queued locally, not yet inserted.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub message_id: Uuid,
    pub destination: String,
    pub message_type: String,
    pub envelope_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub scope: Option<Value>,
    pub stream_id: Option<Uuid>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
}

/// A new perspective-event row queued locally, not yet inserted.
#[derive(Debug, Clone)]
pub struct NewPerspectiveEvent {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub event_id: Uuid,
    pub sequence_number: i64,
    pub partition_number: Option<i32>,
}

/// A new inbox row queued locally, not yet inserted.
#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub message_id: Uuid,
    pub handler_name: String,
    pub destination: String,
    pub message_type: String,
    pub envelope_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub scope: Option<Value>,
    pub stream_id: Option<Uuid>,
    pub partition_number: Option<i32>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub message_id: Uuid,
    pub destination: String,
    pub message_type: String,
    pub envelope_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub scope: Option<Value>,
    pub stream_id: Option<Uuid>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
    pub status: i32,
    pub attempts: i32,
    pub error: Option<String>,
    pub failure_reason: i32,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxRow {
    pub message_id: Uuid,
    pub handler_name: String,
    pub destination: String,
    pub message_type: String,
    pub envelope_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub scope: Option<Value>,
    pub stream_id: Option<Uuid>,
    pub partition_number: Option<i32>,
    pub status: i32,
    pub attempts: i32,
    pub error: Option<String>,
    pub failure_reason: i32,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PerspectiveEventRow {
    pub event_work_id: Uuid,
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub event_id: Uuid,
    pub sequence_number: i64,
    pub partition_number: Option<i32>,
    pub status: i32,
    pub attempts: i32,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PerspectiveCheckpointRow {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub last_event_id: Option<Uuid>,
    pub status: i32,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveStreamRow {
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub assigned_instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceInstanceRow {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub active: bool,
}

/// Outcome of completing or failing a queued outbox item: the caller learns
/// which rows this instance actually held the lease on (completions/
/// failures for rows leased elsewhere are silently dropped).
#[derive(Debug, Clone)]
pub struct OutboxOutcome {
    pub message_id: Uuid,
    pub stream_id: Option<Uuid>,
    pub was_applied: bool,
}

#[derive(Debug, Clone)]
pub struct InboxOutcome {
    pub message_id: Uuid,
    pub handler_name: String,
    pub stream_id: Option<Uuid>,
    pub was_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub message_id: Uuid,
    pub stream_id: Option<Uuid>,
    pub was_newly_created: bool,
}

#[derive(Debug, Clone)]
pub struct PerspectiveStoreOutcome {
    pub event_work_id: Uuid,
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub was_newly_created: bool,
}

/// Everything `process_work_batch` queues for one flush.
#[derive(Debug, Clone, Default)]
pub struct WorkBatchRequest {
    pub outbox_inserts: Vec<NewOutboxMessage>,
    pub outbox_completions: Vec<OutboxCompletion>,
    pub outbox_failures: Vec<OutboxFailure>,
    pub inbox_inserts: Vec<NewInboxMessage>,
    pub inbox_completions: Vec<InboxCompletion>,
    pub inbox_failures: Vec<InboxFailure>,
    pub perspective_inserts: Vec<NewPerspectiveEvent>,
    pub perspective_completions: Vec<PerspectiveCompletion>,
    pub request_outbox_work: bool,
    pub request_inbox_work: bool,
    pub request_perspective_work: bool,
}

#[derive(Debug, Clone)]
pub struct OutboxCompletion {
    pub message_id: Uuid,
    pub completed_status: i32,
}

#[derive(Debug, Clone)]
pub struct OutboxFailure {
    pub message_id: Uuid,
    pub partial_status: i32,
    pub error: String,
    pub failure_reason: i32,
}

#[derive(Debug, Clone)]
pub struct InboxCompletion {
    pub message_id: Uuid,
    pub handler_name: String,
    pub completed_status: i32,
}

#[derive(Debug, Clone)]
pub struct InboxFailure {
    pub message_id: Uuid,
    pub handler_name: String,
    pub partial_status: i32,
    pub error: String,
    pub failure_reason: i32,
}

/// `event_id` is the event just attempted, win or lose. On success it
/// becomes the checkpoint's new `last_event_id`; on failure the checkpoint's
/// existing `last_event_id` is left untouched — a failed attempt must not
/// erase prior progress.
#[derive(Debug, Clone)]
pub struct PerspectiveCompletion {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub event_id: Uuid,
    pub status: i32,
    pub error: Option<String>,
}

/// What `process_work_batch` hands back: work this instance now holds the
/// lease on, tagged with how it came to hold it.
#[derive(Debug, Clone, Default)]
pub struct WorkBatchResult {
    pub outbox_work: Vec<(OutboxRow, WorkFlags)>,
    pub inbox_work: Vec<(InboxRow, WorkFlags)>,
    pub perspective_work: Vec<(PerspectiveEventRow, WorkFlags)>,
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceRank {
    pub rank: i64,
    pub active_instance_count: i64,
}

#[derive(Debug, Clone)]
pub struct MessageAssociation {
    pub message_type: String,
    pub handler_name: String,
    pub perspective_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssociationReconciliation {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}
