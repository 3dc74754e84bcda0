//! Reference binary wiring one work-coordinator process together, the way
//! each of the teacher's `*-service` binaries wires its own domain logic
//! onto the shared `backend/libs` crates. This binary's receptor and
//! projection are deliberately trivial — a real deployment supplies its own
//! via [`wc_service::run_service`] instead of running this binary as-is.

use std::sync::Arc;

use async_trait::async_trait;
use event_store::{Event, EventStore, PostgresEventStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wc_coordinator::CoordinatorConfig;
use wc_storage::NewOutboxMessage;
use wc_transport::{InMemoryTransport, RawEnvelope, Transport};
use wc_workers::{EventStoreReader, Projection, ProjectionError, Receptor, ReceptorError};

struct LoggingReceptor;

#[async_trait]
impl Receptor for LoggingReceptor {
    fn handler_name(&self) -> &str {
        "logging-receptor"
    }

    async fn receive(&self, envelope: &RawEnvelope) -> Result<Vec<NewOutboxMessage>, ReceptorError> {
        tracing::info!(message_id = %envelope.message_id, "received envelope");
        Ok(vec![])
    }
}

struct EventCountProjection;

impl Projection for EventCountProjection {
    fn name(&self) -> &str {
        "event-count"
    }

    fn apply(&self, model: Option<serde_json::Value>, _event: &Event) -> Result<serde_json::Value, ProjectionError> {
        let current = model.and_then(|v| v.get("count").and_then(|c| c.as_i64())).unwrap_or(0);
        Ok(serde_json::json!({ "count": current + 1 }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoordinatorConfig::from_env().unwrap_or_default();
    tracing::info!(?config, "starting work-coordinator service");

    let pool = wc_service::connect_pool(&config).await?;
    let event_reader = Arc::new(EventStoreReader::new(PostgresEventStore::new(pool.clone())));
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    transport.initialize().await?;

    let handle = wc_service::run_service(
        config.clone(),
        "wc-service",
        pool,
        "public",
        transport,
        vec![Arc::new(LoggingReceptor)],
        event_reader,
        vec![Arc::new(EventCountProjection)],
        8,
    )
    .await?;

    tracing::info!(instance_id = %handle.instance_id(), "service started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    handle.shutdown(config.drain_timeout()).await?;

    Ok(())
}
