//! Assembles one work-coordinator process: an [`InstanceRegistry`]
//! heartbeat, a [`PublisherWorker`], a [`ConsumerWorker`] per subscribed
//! destination, and a [`PerspectiveRunner`] per registered projection, all
//! sharing one [`CoordinatorStore`] and one [`Transport`]. Mirrors the
//! teacher's per-service `main.rs` (tracing init, config-from-env, pool
//! construction) generalized into a reusable library so a concrete
//! application supplies its own receptors/projections rather than this
//! crate hard-coding a domain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use wc_coordinator::{CoordinatorConfig, InstanceHandle, InstanceRegistry};
use wc_storage::{CoordinatorStore, ReadModelStore, SqlxCoordinatorStore, SqlxReadModelStore};
use wc_transport::Transport;
use wc_workers::{ConsumerWorker, EventReader, PerspectiveRunner, Projection, PublisherWorker, Receptor};

pub struct ServiceHandle {
    instance: InstanceHandle,
    cancellation: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn instance_id(&self) -> uuid::Uuid {
        self.instance.instance_id()
    }

    /// Stops every worker loop, drains in-flight work up to the config's
    /// `drain_timeout`, then deactivates the instance row.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> wc_storage::StorageResult<()> {
        self.cancellation.cancel();
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(drain_timeout, task).await;
        }
        self.instance.shutdown().await
    }
}

/// Builds the pool through `db_pool::create_pool`, which verifies the
/// connection with a `SELECT 1` probe and starts a background task that
/// republishes pool gauges on an interval — the ambient database-access
/// stack every component shares, not something this crate reimplements.
pub async fn connect_pool(config: &CoordinatorConfig) -> anyhow::Result<sqlx::PgPool> {
    let mut db_config = db_pool::DbConfig::from_env("work-coordinator").unwrap_or_default();
    db_config.database_url = config.database_url.clone();
    db_config.log_config();
    let pool = db_pool::create_pool(db_config).await?;
    Ok(pool)
}

/// Wires and starts the publisher, a consumer per receptor, and a
/// perspective runner per projection against a single shared store and
/// transport. Returns once every loop has started; loops run until
/// [`ServiceHandle::shutdown`] is called.
pub async fn run_service<R: EventReader + Send + Sync + 'static>(
    config: CoordinatorConfig,
    service_name: impl Into<String>,
    pool: sqlx::PgPool,
    schema: impl Into<String>,
    transport: Arc<dyn Transport>,
    receptors: Vec<Arc<dyn Receptor>>,
    event_reader: Arc<R>,
    projections: Vec<Arc<dyn Projection>>,
    worker_pool_size: usize,
) -> anyhow::Result<ServiceHandle> {
    let schema = schema.into();
    let store: Arc<dyn CoordinatorStore> = Arc::new(SqlxCoordinatorStore::new(pool.clone(), schema.clone()));
    let read_models: Arc<dyn ReadModelStore> = Arc::new(SqlxReadModelStore::new(pool, schema));

    let registry = InstanceRegistry::new(Arc::clone(&store), service_name);
    let instance = registry.register(Duration::from_secs(10)).await?;
    let instance_id = instance.instance_id();

    let cancellation = CancellationToken::new();
    let mut tasks = Vec::new();

    let publisher = PublisherWorker::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        instance_id,
        config.clone(),
        worker_pool_size,
    );
    let publisher_cancel = cancellation.clone();
    tasks.push(tokio::spawn(async move {
        publisher.run(Duration::from_millis(500), publisher_cancel).await;
    }));

    for receptor in receptors {
        let consumer = Arc::new(ConsumerWorker::new(
            Arc::clone(&store),
            instance_id,
            config.lease_seconds,
            Arc::clone(&receptor),
            config.debug_mode,
        ));
        let handler = consumer.as_transport_handler();
        let destination = format!("{}.inbound", receptor.handler_name());
        let subscription = transport.subscribe(&destination, handler).await?;
        info!(destination, "consumer subscribed");
        // Subscriptions own their background task; hold them for the
        // process lifetime by leaking into a task that waits on
        // cancellation before unsubscribing.
        let sub_cancel = cancellation.clone();
        tasks.push(tokio::spawn(async move {
            sub_cancel.cancelled().await;
            let _ = subscription.unsubscribe().await;
        }));
    }

    for projection in projections {
        let runner = PerspectiveRunner::new(
            Arc::clone(&store),
            Arc::clone(&read_models),
            Arc::clone(&event_reader),
            instance_id,
            config.lease_seconds,
            projection,
            config.debug_mode,
        );
        let runner_cancel = cancellation.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runner_cancel.cancelled() => break,
                    result = runner.process_batch() => {
                        if let Err(error) = result {
                            tracing::error!(%error, "perspective batch failed");
                        }
                    }
                }
                tokio::select! {
                    _ = runner_cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        }));
    }

    Ok(ServiceHandle {
        instance,
        cancellation,
        tasks,
    })
}
