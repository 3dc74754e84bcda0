//! [`CoordinatorStore`]: the atomic database primitives from the storage
//! contract. Each primitive is a parameterized, pre-typed wrapper over one
//! SQL statement or small transaction — no stored procedures, matching how
//! the teacher's `transactional-outbox`/`event-store` crates issue raw
//! `sqlx::query`/`query_as` calls with manual row mapping rather than
//! relying on compile-time-checked `query!` macros (which need a live
//! database at build time).
//!
//! `process_work_batch` is the one contract that spans several tables in a
//! single round trip: it is implemented as one transaction that calls the
//! same private per-table helpers the other public methods use, so there is
//! exactly one code path per table operation regardless of whether it's
//! invoked standalone or as part of a batch.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::status::{self, WorkFlags};
use crate::types::*;

#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// The single atomic call a coordinator flush issues: applies queued
    /// completions/failures, inserts new rows, claims orphaned work this
    /// instance is entitled to, and refreshes the caller's heartbeat.
    /// `debug_mode` gates whether a successful outbox/inbox completion
    /// deletes its row (production) or retains it for inspection (debug).
    async fn process_work_batch(
        &self,
        instance_id: Uuid,
        request: WorkBatchRequest,
        lease_seconds: i64,
        debug_mode: bool,
    ) -> StorageResult<WorkBatchResult>;

    /// `rank` of `instance_id` among currently-live instances, and how many
    /// are live, for the partition-balancing formula in the stream registry.
    async fn calculate_instance_rank(
        &self,
        instance_id: Uuid,
        stale_cutoff_secs: i64,
    ) -> StorageResult<InstanceRank>;

    /// Claim outbox/inbox/perspective rows whose lease has expired (or were
    /// never claimed), restricted to partitions this rank owns and to
    /// streams whose `active_streams` row this instance holds.
    async fn claim_orphaned_receptor_work(
        &self,
        instance_id: Uuid,
        rank: i64,
        active_instance_count: i64,
        lease_seconds: i64,
        batch_size: i64,
    ) -> StorageResult<WorkBatchResult>;

    /// Marks all unprocessed perspective-event rows for `(stream_id,
    /// perspective_name)` as processed and updates the checkpoint; clears
    /// `CATCHING_UP` on a successful completion. Always called as its own
    /// step, never folded into `process_work_batch`.
    async fn complete_perspective_checkpoint_work(
        &self,
        completion: PerspectiveCompletion,
    ) -> StorageResult<()>;

    /// Reconciles the receptor/perspective registrations declared by this
    /// process against what's recorded in the database.
    async fn register_message_associations(
        &self,
        associations: Vec<MessageAssociation>,
    ) -> StorageResult<AssociationReconciliation>;

    async fn upsert_heartbeat(
        &self,
        instance_id: Uuid,
        service_name: &str,
        host_name: &str,
        process_id: i32,
    ) -> StorageResult<()>;

    async fn deactivate_instance(&self, instance_id: Uuid) -> StorageResult<()>;
}

pub struct SqlxCoordinatorStore {
    pool: PgPool,
    schema: String,
}

impl SqlxCoordinatorStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn t(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }
}

#[async_trait]
impl CoordinatorStore for SqlxCoordinatorStore {
    async fn process_work_batch(
        &self,
        instance_id: Uuid,
        request: WorkBatchRequest,
        lease_seconds: i64,
        debug_mode: bool,
    ) -> StorageResult<WorkBatchResult> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let lease_expiry = now + Duration::seconds(lease_seconds);

        touch_heartbeat(&mut tx, &self.t("service_instances"), instance_id, now).await?;

        // Streams whose outbox/inbox/perspective queues may have just
        // drained to empty, checked once at the end of the flush.
        let mut touched_streams = std::collections::HashSet::new();

        for completion in &request.outbox_completions {
            if let Some(stream_id) =
                apply_outbox_completion(&mut tx, &self.t("outbox"), instance_id, completion, debug_mode).await?
            {
                touched_streams.insert(stream_id);
            }
        }
        for failure in &request.outbox_failures {
            apply_outbox_failure(&mut tx, &self.t("outbox"), instance_id, failure, now).await?;
        }
        for completion in &request.inbox_completions {
            if let Some(stream_id) =
                apply_inbox_completion(&mut tx, &self.t("inbox"), instance_id, completion, debug_mode).await?
            {
                touched_streams.insert(stream_id);
            }
        }
        for failure in &request.inbox_failures {
            apply_inbox_failure(&mut tx, &self.t("inbox"), instance_id, failure, now).await?;
        }
        for completion in &request.perspective_completions {
            apply_perspective_completion(
                &mut tx,
                &self.t("perspective_checkpoints"),
                &self.t("perspective_events"),
                completion,
                now,
            )
            .await?;
            touched_streams.insert(completion.stream_id);
        }

        let mut result = WorkBatchResult::default();

        for insert in &request.outbox_inserts {
            let outcome = insert_outbox_row(
                &mut tx,
                &self.t("outbox"),
                &self.t("active_streams"),
                insert,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
            if outcome.was_newly_created {
                if let Some(row) = fetch_outbox_row(&mut tx, &self.t("outbox"), outcome.message_id).await? {
                    result.outbox_work.push((row, WorkFlags::NewlyStored));
                }
            }
        }

        for insert in &request.inbox_inserts {
            let outcome = insert_inbox_row(
                &mut tx,
                &self.t("inbox"),
                &self.t("active_streams"),
                insert,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
            if outcome.was_applied {
                if let Some(row) =
                    fetch_inbox_row(&mut tx, &self.t("inbox"), outcome.message_id, &insert.handler_name).await?
                {
                    result.inbox_work.push((row, WorkFlags::NewlyStored));
                }
            }
        }

        for insert in &request.perspective_inserts {
            let outcome = insert_perspective_event(
                &mut tx,
                &self.t("perspective_events"),
                &self.t("active_streams"),
                insert,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
            if outcome.was_newly_created {
                if let Some(row) =
                    fetch_perspective_row(&mut tx, &self.t("perspective_events"), outcome.event_work_id).await?
                {
                    result.perspective_work.push((row, WorkFlags::NewlyStored));
                }
            }
        }

        if request.request_outbox_work {
            let inherited = fetch_inherited_outbox(&mut tx, &self.t("outbox"), instance_id).await?;
            result
                .outbox_work
                .extend(inherited.into_iter().map(|r| (r, WorkFlags::Inherited)));
        }
        if request.request_inbox_work {
            let inherited = fetch_inherited_inbox(&mut tx, &self.t("inbox"), instance_id).await?;
            result
                .inbox_work
                .extend(inherited.into_iter().map(|r| (r, WorkFlags::Inherited)));
        }
        if request.request_perspective_work {
            let inherited =
                fetch_inherited_perspective(&mut tx, &self.t("perspective_events"), instance_id).await?;
            result
                .perspective_work
                .extend(inherited.into_iter().map(|r| (r, WorkFlags::Inherited)));
        }

        for stream_id in touched_streams {
            drain_active_stream_if_empty(
                &mut tx,
                &self.t("active_streams"),
                &self.t("outbox"),
                &self.t("inbox"),
                &self.t("perspective_events"),
                stream_id,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn calculate_instance_rank(
        &self,
        instance_id: Uuid,
        stale_cutoff_secs: i64,
    ) -> StorageResult<InstanceRank> {
        let cutoff = Utc::now() - Duration::seconds(stale_cutoff_secs);
        let table = self.t("service_instances");
        let rows: Vec<Uuid> = sqlx::query_scalar(&format!(
            "SELECT instance_id FROM {table}
             WHERE active = TRUE AND last_heartbeat_at >= $1
             ORDER BY instance_id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let active_instance_count = rows.len() as i64;
        let rank = rows
            .iter()
            .position(|id| *id == instance_id)
            .map(|p| p as i64)
            .unwrap_or(0);

        Ok(InstanceRank {
            rank,
            active_instance_count: active_instance_count.max(1),
        })
    }

    async fn claim_orphaned_receptor_work(
        &self,
        instance_id: Uuid,
        rank: i64,
        active_instance_count: i64,
        lease_seconds: i64,
        batch_size: i64,
    ) -> StorageResult<WorkBatchResult> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let lease_expiry = now + Duration::seconds(lease_seconds);
        let mut result = WorkBatchResult::default();

        let outbox_table = self.t("outbox");
        let inbox_table = self.t("inbox");
        let perspective_table = self.t("perspective_events");
        let active_streams_table = self.t("active_streams");

        // A stream's rows can only be handed to an instance that owns the
        // stream's active_streams row: claim ownership of any orphaned or
        // unclaimed streams in this instance's partitions before claiming
        // the rows themselves, so the claim queries' join below sees it.
        reclaim_stream_ownership(
            &mut tx,
            &active_streams_table,
            &outbox_table,
            &inbox_table,
            &perspective_table,
            instance_id,
            active_instance_count,
            rank,
            lease_expiry,
            now,
        )
        .await?;

        let claimed: Vec<OutboxRow> = sqlx::query_as(&format!(
            "UPDATE {outbox_table} o SET instance_id = $1, lease_expiry = $2
             FROM (
                SELECT o2.message_id FROM {outbox_table} o2
                LEFT JOIN {active_streams_table} a ON a.stream_id = o2.stream_id
                WHERE o2.status & {failed} = 0
                  AND (o2.lease_expiry IS NULL OR o2.lease_expiry < $3)
                  AND (o2.partition_number IS NULL OR o2.partition_number % $4 = $5)
                  AND (o2.stream_id IS NULL OR a.assigned_instance_id = $1)
                ORDER BY o2.partition_number, o2.created_at
                LIMIT $6
                FOR UPDATE OF o2 SKIP LOCKED
             ) claimable
             WHERE o.message_id = claimable.message_id
             RETURNING o.*",
            failed = status::FAILED,
        ))
        .bind(instance_id)
        .bind(lease_expiry)
        .bind(now)
        .bind(active_instance_count)
        .bind(rank)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;
        result
            .outbox_work
            .extend(claimed.into_iter().map(|r| (r, WorkFlags::Reclaimed)));

        let claimed: Vec<InboxRow> = sqlx::query_as(&format!(
            "UPDATE {inbox_table} i SET instance_id = $1, lease_expiry = $2
             FROM (
                SELECT i2.message_id, i2.handler_name FROM {inbox_table} i2
                LEFT JOIN {active_streams_table} a ON a.stream_id = i2.stream_id
                WHERE i2.status & {failed} = 0
                  AND (i2.lease_expiry IS NULL OR i2.lease_expiry < $3)
                  AND (i2.partition_number IS NULL OR i2.partition_number % $4 = $5)
                  AND (i2.stream_id IS NULL OR a.assigned_instance_id = $1)
                ORDER BY i2.partition_number, i2.received_at
                LIMIT $6
                FOR UPDATE OF i2 SKIP LOCKED
             ) claimable
             WHERE i.message_id = claimable.message_id AND i.handler_name = claimable.handler_name
             RETURNING i.*",
            failed = status::FAILED,
        ))
        .bind(instance_id)
        .bind(lease_expiry)
        .bind(now)
        .bind(active_instance_count)
        .bind(rank)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;
        result
            .inbox_work
            .extend(claimed.into_iter().map(|r| (r, WorkFlags::Reclaimed)));

        let claimed: Vec<PerspectiveEventRow> = sqlx::query_as(&format!(
            "UPDATE {perspective_table} p SET instance_id = $1, lease_expiry = $2
             FROM (
                SELECT p2.event_work_id FROM {perspective_table} p2
                LEFT JOIN {active_streams_table} a ON a.stream_id = p2.stream_id
                WHERE p2.status & {failed} = 0
                  AND (p2.lease_expiry IS NULL OR p2.lease_expiry < $3)
                  AND (p2.partition_number IS NULL OR p2.partition_number % $4 = $5)
                  AND a.assigned_instance_id = $1
                ORDER BY p2.partition_number, p2.sequence_number
                LIMIT $6
                FOR UPDATE OF p2 SKIP LOCKED
             ) claimable
             WHERE p.event_work_id = claimable.event_work_id
             RETURNING p.*",
            failed = status::FAILED,
        ))
        .bind(instance_id)
        .bind(lease_expiry)
        .bind(now)
        .bind(active_instance_count)
        .bind(rank)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;
        result
            .perspective_work
            .extend(claimed.into_iter().map(|r| (r, WorkFlags::Reclaimed)));

        tx.commit().await?;
        Ok(result)
    }

    async fn complete_perspective_checkpoint_work(
        &self,
        completion: PerspectiveCompletion,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        let stream_id = completion.stream_id;
        apply_perspective_completion(
            &mut tx,
            &self.t("perspective_checkpoints"),
            &self.t("perspective_events"),
            &completion,
            Utc::now(),
        )
        .await?;
        drain_active_stream_if_empty(
            &mut tx,
            &self.t("active_streams"),
            &self.t("outbox"),
            &self.t("inbox"),
            &self.t("perspective_events"),
            stream_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn register_message_associations(
        &self,
        associations: Vec<MessageAssociation>,
    ) -> StorageResult<AssociationReconciliation> {
        let table = self.t("message_associations");
        let mut tx = self.pool.begin().await?;
        let mut reconciliation = AssociationReconciliation::default();

        let existing: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT message_type, handler_name FROM {table}"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let declared: std::collections::HashSet<(String, String)> = associations
            .iter()
            .map(|a| (a.message_type.clone(), a.handler_name.clone()))
            .collect();

        for association in &associations {
            let result = sqlx::query(&format!(
                "INSERT INTO {table} (message_type, handler_name, perspective_name)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (message_type, handler_name)
                 DO UPDATE SET perspective_name = EXCLUDED.perspective_name
                 WHERE {table}.perspective_name IS DISTINCT FROM EXCLUDED.perspective_name"
            ))
            .bind(&association.message_type)
            .bind(&association.handler_name)
            .bind(&association.perspective_name)
            .execute(&mut *tx)
            .await?;

            let is_new = !existing
                .iter()
                .any(|(mt, hn)| mt == &association.message_type && hn == &association.handler_name);
            if is_new {
                reconciliation.inserted += 1;
            } else if result.rows_affected() > 0 {
                reconciliation.updated += 1;
            }
        }

        for (message_type, handler_name) in &existing {
            if !declared.contains(&(message_type.clone(), handler_name.clone())) {
                sqlx::query(&format!(
                    "DELETE FROM {table} WHERE message_type = $1 AND handler_name = $2"
                ))
                .bind(message_type)
                .bind(handler_name)
                .execute(&mut *tx)
                .await?;
                reconciliation.deleted += 1;
            }
        }

        tx.commit().await?;
        Ok(reconciliation)
    }

    async fn upsert_heartbeat(
        &self,
        instance_id: Uuid,
        service_name: &str,
        host_name: &str,
        process_id: i32,
    ) -> StorageResult<()> {
        let table = self.t("service_instances");
        sqlx::query(&format!(
            "INSERT INTO {table} (instance_id, service_name, host_name, process_id, last_heartbeat_at, active)
             VALUES ($1, $2, $3, $4, now(), TRUE)
             ON CONFLICT (instance_id)
             DO UPDATE SET last_heartbeat_at = now(), active = TRUE"
        ))
        .bind(instance_id)
        .bind(service_name)
        .bind(host_name)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_instance(&self, instance_id: Uuid) -> StorageResult<()> {
        let table = self.t("service_instances");
        sqlx::query(&format!("UPDATE {table} SET active = FALSE WHERE instance_id = $1"))
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn touch_heartbeat(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(&format!(
        "UPDATE {table} SET last_heartbeat_at = $1 WHERE instance_id = $2"
    ))
    .bind(now)
    .bind(instance_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Returns the row's `stream_id` (if it had one) so the caller can check
/// whether the stream just drained. `debug_mode` retains the row after a
/// successful publish instead of deleting it.
async fn apply_outbox_completion(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
    completion: &OutboxCompletion,
    debug_mode: bool,
) -> StorageResult<Option<Uuid>> {
    // Completions for rows not leased to this instance are silently
    // discarded: the WHERE clause on instance_id is the enforcement point.
    if debug_mode {
        let stream_id: Option<Option<Uuid>> = sqlx::query_scalar(&format!(
            "UPDATE {table}
             SET status = status | $1, instance_id = NULL, lease_expiry = NULL, published_at = now(), processed_at = now()
             WHERE message_id = $2 AND instance_id = $3
             RETURNING stream_id"
        ))
        .bind(completion.completed_status)
        .bind(completion.message_id)
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(stream_id.flatten())
    } else {
        let stream_id: Option<Option<Uuid>> = sqlx::query_scalar(&format!(
            "DELETE FROM {table} WHERE message_id = $1 AND instance_id = $2 RETURNING stream_id"
        ))
        .bind(completion.message_id)
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(stream_id.flatten())
    }
}

async fn apply_outbox_failure(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
    failure: &OutboxFailure,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let reason = status::FailureReason::from(failure.failure_reason);
    let attempt_increment = if reason.consumes_attempt() { 1 } else { 0 };

    sqlx::query(&format!(
        "UPDATE {table}
         SET status = (status | $1 | $2),
             attempts = attempts + $3,
             error = $4,
             failure_reason = $2,
             instance_id = NULL,
             lease_expiry = NULL,
             scheduled_for = $5 + (interval '30 seconds' * power(2, attempts + $3))
         WHERE message_id = $6 AND instance_id = $7",
    ))
    .bind(failure.partial_status)
    .bind(failure.failure_reason)
    .bind(attempt_increment)
    .bind(&failure.error)
    .bind(now)
    .bind(failure.message_id)
    .bind(instance_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Returns the row's `stream_id` (if it had one) so the caller can check
/// whether the stream just drained. A row is deleted once `EventStored` is
/// set, unless `debug_mode` asks to retain it for inspection.
async fn apply_inbox_completion(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
    completion: &InboxCompletion,
    debug_mode: bool,
) -> StorageResult<Option<Uuid>> {
    if status::has_bit(completion.completed_status, status::EVENT_STORED) && !debug_mode {
        let stream_id: Option<Option<Uuid>> = sqlx::query_scalar(&format!(
            "DELETE FROM {table} WHERE message_id = $1 AND handler_name = $2 AND instance_id = $3
             RETURNING stream_id"
        ))
        .bind(completion.message_id)
        .bind(&completion.handler_name)
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(stream_id.flatten())
    } else {
        let stream_id: Option<Option<Uuid>> = sqlx::query_scalar(&format!(
            "UPDATE {table}
             SET status = status | $1, instance_id = NULL, lease_expiry = NULL, processed_at = now()
             WHERE message_id = $2 AND handler_name = $3 AND instance_id = $4
             RETURNING stream_id"
        ))
        .bind(completion.completed_status)
        .bind(completion.message_id)
        .bind(&completion.handler_name)
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(stream_id.flatten())
    }
}

async fn apply_inbox_failure(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
    failure: &InboxFailure,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let reason = status::FailureReason::from(failure.failure_reason);
    let attempt_increment = if reason.consumes_attempt() { 1 } else { 0 };

    sqlx::query(&format!(
        "UPDATE {table}
         SET status = (status | $1 | $2),
             attempts = attempts + $3,
             error = $4,
             failure_reason = $2,
             instance_id = NULL,
             lease_expiry = NULL,
             scheduled_for = $5 + (interval '30 seconds' * power(2, attempts + $3))
         WHERE message_id = $6 AND handler_name = $7 AND instance_id = $8",
    ))
    .bind(failure.partial_status)
    .bind(failure.failure_reason)
    .bind(attempt_increment)
    .bind(&failure.error)
    .bind(now)
    .bind(failure.message_id)
    .bind(&failure.handler_name)
    .bind(instance_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A failed projection attempt must not erase a previously recorded
/// `last_event_id`: the checkpoint upsert keeps the existing value on
/// failure (`CASE WHEN $is_success ...`), and only the specific event row
/// that failed gets its `attempts` bumped, leaving other unprocessed rows
/// for the stream claimable again.
async fn apply_perspective_completion(
    tx: &mut Transaction<'_, Postgres>,
    checkpoint_table: &str,
    events_table: &str,
    completion: &PerspectiveCompletion,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let is_success = completion.error.is_none();
    let initial_last_event_id = if is_success { Some(completion.event_id) } else { None };

    sqlx::query(&format!(
        "INSERT INTO {checkpoint_table} (stream_id, perspective_name, last_event_id, status, error, processed_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (stream_id, perspective_name)
         DO UPDATE SET
            last_event_id = CASE WHEN $7 THEN EXCLUDED.last_event_id
                                 ELSE {checkpoint_table}.last_event_id END,
            status = CASE WHEN $7 THEN EXCLUDED.status & ~{catching_up}
                          ELSE EXCLUDED.status END,
            error = EXCLUDED.error,
            processed_at = EXCLUDED.processed_at",
        catching_up = status::CATCHING_UP,
    ))
    .bind(completion.stream_id)
    .bind(&completion.perspective_name)
    .bind(initial_last_event_id)
    .bind(completion.status)
    .bind(&completion.error)
    .bind(now)
    .bind(is_success)
    .execute(&mut **tx)
    .await?;

    if is_success {
        sqlx::query(&format!(
            "UPDATE {events_table}
             SET status = status | {stored}, processed_at = now()
             WHERE stream_id = $1 AND perspective_name = $2 AND processed_at IS NULL",
            stored = status::STORED,
        ))
        .bind(completion.stream_id)
        .bind(&completion.perspective_name)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(&format!(
            "UPDATE {events_table}
             SET attempts = attempts + 1, instance_id = NULL, lease_expiry = NULL
             WHERE stream_id = $1 AND perspective_name = $2 AND event_id = $3"
        ))
        .bind(completion.stream_id)
        .bind(&completion.perspective_name)
        .bind(completion.event_id)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn touch_active_stream(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    stream_id: Uuid,
    partition_number: i32,
    instance_id: Uuid,
    lease_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(&format!(
        "INSERT INTO {table} (stream_id, partition_number, assigned_instance_id, lease_expiry, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $5)
         ON CONFLICT (stream_id)
         DO UPDATE SET assigned_instance_id = $3, lease_expiry = $4, updated_at = $5
         WHERE {table}.assigned_instance_id IS NULL
            OR {table}.assigned_instance_id = $3
            OR {table}.lease_expiry < $5"
    ))
    .bind(stream_id)
    .bind(partition_number)
    .bind(instance_id)
    .bind(lease_expiry)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Claims ownership (via [`touch_active_stream`]) of every stream in this
/// instance's partitions that has orphaned or unclaimed work and whose
/// `active_streams` row is absent, unassigned, or lease-expired. Must run
/// before the claim queries below so their `active_streams` join sees the
/// new ownership within the same transaction.
#[allow(clippy::too_many_arguments)]
async fn reclaim_stream_ownership(
    tx: &mut Transaction<'_, Postgres>,
    active_streams_table: &str,
    outbox_table: &str,
    inbox_table: &str,
    perspective_table: &str,
    instance_id: Uuid,
    active_instance_count: i64,
    rank: i64,
    lease_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let candidates: Vec<(Uuid, i32)> = sqlx::query_as(&format!(
        "SELECT DISTINCT stream_id, partition_number FROM (
            SELECT stream_id, partition_number FROM {outbox_table}
             WHERE stream_id IS NOT NULL AND status & {failed} = 0
               AND (lease_expiry IS NULL OR lease_expiry < $3)
               AND (partition_number IS NULL OR partition_number % $1 = $2)
            UNION ALL
            SELECT stream_id, partition_number FROM {inbox_table}
             WHERE stream_id IS NOT NULL AND status & {failed} = 0
               AND (lease_expiry IS NULL OR lease_expiry < $3)
               AND (partition_number IS NULL OR partition_number % $1 = $2)
            UNION ALL
            SELECT stream_id, partition_number FROM {perspective_table}
             WHERE status & {failed} = 0
               AND (lease_expiry IS NULL OR lease_expiry < $3)
               AND (partition_number IS NULL OR partition_number % $1 = $2)
         ) candidates
         WHERE stream_id IS NOT NULL AND partition_number IS NOT NULL
           AND NOT EXISTS (
                SELECT 1 FROM {active_streams_table} a
                WHERE a.stream_id = candidates.stream_id
                  AND a.assigned_instance_id IS NOT NULL
                  AND a.lease_expiry >= $3
           )",
        failed = status::FAILED,
    ))
    .bind(active_instance_count)
    .bind(rank)
    .bind(now)
    .fetch_all(&mut **tx)
    .await?;

    for (stream_id, partition_number) in candidates {
        touch_active_stream(
            tx,
            active_streams_table,
            stream_id,
            partition_number,
            instance_id,
            lease_expiry,
            now,
        )
        .await?;
    }

    Ok(())
}

/// Deletes the `active_streams` row once its outbox, inbox, and perspective
/// queues are all empty (no row with a pending publish/process step). A
/// no-op if any queue still has pending work, so it's safe to call after
/// every completion regardless of whether this particular one drained it.
async fn drain_active_stream_if_empty(
    tx: &mut Transaction<'_, Postgres>,
    active_streams_table: &str,
    outbox_table: &str,
    inbox_table: &str,
    perspective_table: &str,
    stream_id: Uuid,
) -> StorageResult<()> {
    sqlx::query(&format!(
        "DELETE FROM {active_streams_table}
         WHERE stream_id = $1
           AND NOT EXISTS (SELECT 1 FROM {outbox_table} WHERE stream_id = $1 AND published_at IS NULL)
           AND NOT EXISTS (SELECT 1 FROM {inbox_table} WHERE stream_id = $1 AND processed_at IS NULL)
           AND NOT EXISTS (SELECT 1 FROM {perspective_table} WHERE stream_id = $1 AND processed_at IS NULL)"
    ))
    .bind(stream_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_outbox_row(
    tx: &mut Transaction<'_, Postgres>,
    outbox_table: &str,
    active_streams_table: &str,
    insert: &NewOutboxMessage,
    instance_id: Uuid,
    lease_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<StoreOutcome> {
    let result = sqlx::query(&format!(
        "INSERT INTO {outbox_table}
            (message_id, destination, message_type, envelope_type, event_data, metadata, scope,
             stream_id, partition_number, is_event, status, instance_id, lease_expiry, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         ON CONFLICT (message_id) DO NOTHING"
    ))
    .bind(insert.message_id)
    .bind(&insert.destination)
    .bind(&insert.message_type)
    .bind(&insert.envelope_type)
    .bind(&insert.event_data)
    .bind(&insert.metadata)
    .bind(&insert.scope)
    .bind(insert.stream_id)
    .bind(insert.partition_number)
    .bind(insert.is_event)
    .bind(status::STORED)
    .bind(instance_id)
    .bind(lease_expiry)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let was_newly_created = result.rows_affected() > 0;

    if was_newly_created {
        if let (Some(stream_id), Some(partition_number)) = (insert.stream_id, insert.partition_number) {
            touch_active_stream(
                tx,
                active_streams_table,
                stream_id,
                partition_number,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
        }
    }

    Ok(StoreOutcome {
        message_id: insert.message_id,
        stream_id: insert.stream_id,
        was_newly_created,
    })
}

async fn insert_inbox_row(
    tx: &mut Transaction<'_, Postgres>,
    inbox_table: &str,
    active_streams_table: &str,
    insert: &NewInboxMessage,
    instance_id: Uuid,
    lease_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<OutboxOutcome> {
    // ON CONFLICT DO NOTHING is the entirety of the idempotent-receive
    // guarantee: a redelivered (message_id, handler_name) pair is a no-op.
    let result = sqlx::query(&format!(
        "INSERT INTO {inbox_table}
            (message_id, handler_name, destination, message_type, envelope_type, event_data, metadata,
             scope, stream_id, partition_number, status, instance_id, lease_expiry, received_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         ON CONFLICT (message_id, handler_name) DO NOTHING"
    ))
    .bind(insert.message_id)
    .bind(&insert.handler_name)
    .bind(&insert.destination)
    .bind(&insert.message_type)
    .bind(&insert.envelope_type)
    .bind(&insert.event_data)
    .bind(&insert.metadata)
    .bind(&insert.scope)
    .bind(insert.stream_id)
    .bind(insert.partition_number)
    .bind(status::STORED)
    .bind(instance_id)
    .bind(lease_expiry)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let was_applied = result.rows_affected() > 0;

    if was_applied {
        if let (Some(stream_id), Some(partition_number)) = (insert.stream_id, insert.partition_number) {
            touch_active_stream(
                tx,
                active_streams_table,
                stream_id,
                partition_number,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
        }
    }

    Ok(OutboxOutcome {
        message_id: insert.message_id,
        stream_id: insert.stream_id,
        was_applied,
    })
}

async fn insert_perspective_event(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    active_streams_table: &str,
    insert: &NewPerspectiveEvent,
    instance_id: Uuid,
    lease_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<PerspectiveStoreOutcome> {
    let event_work_id = Uuid::new_v4();
    let result = sqlx::query(&format!(
        "INSERT INTO {table}
            (event_work_id, stream_id, perspective_name, event_id, sequence_number, partition_number, status, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (stream_id, perspective_name, event_id) DO NOTHING"
    ))
    .bind(event_work_id)
    .bind(insert.stream_id)
    .bind(&insert.perspective_name)
    .bind(insert.event_id)
    .bind(insert.sequence_number)
    .bind(insert.partition_number)
    .bind(status::STORED)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let was_newly_created = result.rows_affected() > 0;

    if was_newly_created {
        if let Some(partition_number) = insert.partition_number {
            touch_active_stream(
                tx,
                active_streams_table,
                insert.stream_id,
                partition_number,
                instance_id,
                lease_expiry,
                now,
            )
            .await?;
        }
    }

    Ok(PerspectiveStoreOutcome {
        event_work_id,
        stream_id: insert.stream_id,
        perspective_name: insert.perspective_name.clone(),
        was_newly_created,
    })
}

async fn fetch_perspective_row(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    event_work_id: Uuid,
) -> StorageResult<Option<PerspectiveEventRow>> {
    let row = sqlx::query_as(&format!("SELECT * FROM {table} WHERE event_work_id = $1"))
        .bind(event_work_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

async fn fetch_outbox_row(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    message_id: Uuid,
) -> StorageResult<Option<OutboxRow>> {
    let row = sqlx::query_as(&format!("SELECT * FROM {table} WHERE message_id = $1"))
        .bind(message_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

async fn fetch_inbox_row(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    message_id: Uuid,
    handler_name: &str,
) -> StorageResult<Option<InboxRow>> {
    let row = sqlx::query_as(&format!(
        "SELECT * FROM {table} WHERE message_id = $1 AND handler_name = $2"
    ))
    .bind(message_id)
    .bind(handler_name)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

async fn fetch_inherited_outbox(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
) -> StorageResult<Vec<OutboxRow>> {
    let rows = sqlx::query_as(&format!(
        "SELECT * FROM {table}
         WHERE instance_id = $1 AND status & {failed} = 0 AND published_at IS NULL
         ORDER BY partition_number, created_at",
        failed = status::FAILED,
    ))
    .bind(instance_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

async fn fetch_inherited_inbox(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
) -> StorageResult<Vec<InboxRow>> {
    let rows = sqlx::query_as(&format!(
        "SELECT * FROM {table}
         WHERE instance_id = $1 AND status & {failed} = 0 AND processed_at IS NULL
         ORDER BY partition_number, received_at",
        failed = status::FAILED,
    ))
    .bind(instance_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

async fn fetch_inherited_perspective(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    instance_id: Uuid,
) -> StorageResult<Vec<PerspectiveEventRow>> {
    let rows = sqlx::query_as(&format!(
        "SELECT * FROM {table}
         WHERE instance_id = $1 AND status & {failed} = 0 AND processed_at IS NULL
         ORDER BY partition_number, sequence_number",
        failed = status::FAILED,
    ))
    .bind(instance_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[allow(dead_code)]
async fn row_count(tx: &mut Transaction<'_, Postgres>, sql: &str) -> StorageResult<i64> {
    let row = sqlx::query(sql).fetch_one(&mut **tx).await?;
    Ok(row.try_get::<i64, _>(0)?)
}
