//! Generic read-model storage backing every perspective projection. One
//! table, keyed by `(perspective_name, stream_id)`, the same shape
//! `event-store` uses one `events` table for every aggregate type rather
//! than a table per aggregate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StorageResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadModelRow {
    pub perspective_name: String,
    pub stream_id: Uuid,
    pub version: i64,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn load_read_model(
        &self,
        perspective_name: &str,
        stream_id: Uuid,
    ) -> StorageResult<Option<ReadModelRow>>;

    /// Upserts unconditionally on `(perspective_name, stream_id)`. Callers
    /// are responsible for computing `version = old_version + 1` themselves
    /// from the row [`Self::load_read_model`] returned; this is a plain
    /// write, not a compare-and-swap.
    async fn upsert_read_model(
        &self,
        perspective_name: &str,
        stream_id: Uuid,
        version: i64,
        data: Value,
    ) -> StorageResult<()>;
}

pub struct SqlxReadModelStore {
    pool: PgPool,
    schema: String,
}

impl SqlxReadModelStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl ReadModelStore for SqlxReadModelStore {
    async fn load_read_model(
        &self,
        perspective_name: &str,
        stream_id: Uuid,
    ) -> StorageResult<Option<ReadModelRow>> {
        let table = format!("{}.read_models", self.schema);
        let row = sqlx::query_as(&format!(
            "SELECT * FROM {table} WHERE perspective_name = $1 AND stream_id = $2"
        ))
        .bind(perspective_name)
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_read_model(
        &self,
        perspective_name: &str,
        stream_id: Uuid,
        version: i64,
        data: Value,
    ) -> StorageResult<()> {
        let table = format!("{}.read_models", self.schema);
        sqlx::query(&format!(
            "INSERT INTO {table} (perspective_name, stream_id, version, data, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (perspective_name, stream_id)
             DO UPDATE SET version = EXCLUDED.version, data = EXCLUDED.data, updated_at = now()"
        ))
        .bind(perspective_name)
        .bind(stream_id)
        .bind(version)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
