//! Instance registration and heartbeat. Grounded on `db-pool`'s background
//! metrics-updater task (a `tokio::spawn`ed loop ticking on an `interval`,
//! cancelled by dropping/aborting the handle) for the heartbeat loop shape,
//! and on `sgttomas-solver-ralph`'s use of the `hostname` crate for the
//! instance's own identity.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use wc_storage::{CoordinatorStore, StorageResult};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read local hostname: {0}")]
    Hostname(#[source] std::io::Error),
    #[error(transparent)]
    Storage(#[from] wc_storage::StorageError),
}

pub struct InstanceRegistry {
    store: Arc<dyn CoordinatorStore>,
    service_name: String,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn CoordinatorStore>, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
        }
    }

    /// Registers this process as a live instance and starts a background
    /// heartbeat loop. The returned handle's `Drop` does *not* deactivate
    /// the row — that needs an async DB call, which `Drop` can't await —
    /// callers must call [`InstanceHandle::shutdown`] for a clean exit. A
    /// process that crashes without calling it is detected as stale by the
    /// liveness check in [`crate::ownership`] instead.
    pub async fn register(&self, heartbeat_interval: Duration) -> Result<InstanceHandle, RegistryError> {
        let instance_id = Uuid::new_v4();
        let host_name = hostname::get()
            .map_err(RegistryError::Hostname)?
            .to_string_lossy()
            .into_owned();
        let process_id = std::process::id() as i32;

        self.store
            .upsert_heartbeat(instance_id, &self.service_name, &host_name, process_id)
            .await?;

        let cancellation = CancellationToken::new();
        let task = spawn_heartbeat_loop(
            Arc::clone(&self.store),
            instance_id,
            self.service_name.clone(),
            host_name.clone(),
            process_id,
            heartbeat_interval,
            cancellation.clone(),
        );

        info!(%instance_id, %host_name, process_id, "instance registered");

        Ok(InstanceHandle {
            instance_id,
            store: Arc::clone(&self.store),
            cancellation,
            task: Some(task),
        })
    }
}

fn spawn_heartbeat_loop(
    store: Arc<dyn CoordinatorStore>,
    instance_id: Uuid,
    service_name: String,
    host_name: String,
    process_id: i32,
    interval: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = store
                        .upsert_heartbeat(instance_id, &service_name, &host_name, process_id)
                        .await
                    {
                        warn!(%instance_id, %error, "heartbeat upsert failed");
                    }
                }
            }
        }
    })
}

/// Handle to a registered instance. Holds the background heartbeat task and
/// the cancellation token that stops it.
pub struct InstanceHandle {
    instance_id: Uuid,
    store: Arc<dyn CoordinatorStore>,
    cancellation: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Stops the heartbeat loop and marks the instance inactive. Must be
    /// called explicitly before process exit; there is no `Drop`-based
    /// equivalent since deactivation is an async database call.
    pub async fn shutdown(mut self) -> StorageResult<()> {
        self.cancellation.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.store.deactivate_instance(self.instance_id).await
    }
}
