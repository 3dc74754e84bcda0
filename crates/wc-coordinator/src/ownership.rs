//! Stream-ownership and partition-balance orchestration sitting on top of
//! [`wc_storage::CoordinatorStore`]. An `active_streams` row moves through
//! `absent -> assigned -> orphaned -> assigned(new owner)`; this module
//! drives that transition by combining `calculate_instance_rank` with
//! `claim_orphaned_receptor_work`, the same two-step the spec's stream
//! registry describes (rank first, then claim restricted to owned
//! partitions).

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;
use wc_storage::{CoordinatorStore, InstanceRank, StorageResult, WorkBatchResult};

use crate::partition::owns_partition;

#[derive(Debug, Clone, Copy)]
pub struct OwnershipConfig {
    pub stale_cutoff_secs: i64,
    pub lease_seconds: i64,
    pub orphan_batch_size: i64,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            stale_cutoff_secs: 60,
            lease_seconds: 300,
            orphan_batch_size: 100,
        }
    }
}

/// Computes this instance's current rank, then claims whatever orphaned
/// work its partitions are entitled to. Called on a timer by a worker loop
/// independently of the per-request `CoordinatorBatch::flush` path, since
/// orphan recovery has to run even when this instance has no work of its
/// own queued.
pub async fn reclaim_orphaned_work(
    store: &Arc<dyn CoordinatorStore>,
    instance_id: Uuid,
    config: OwnershipConfig,
) -> StorageResult<(InstanceRank, WorkBatchResult)> {
    let rank = store
        .calculate_instance_rank(instance_id, config.stale_cutoff_secs)
        .await?;

    debug!(
        %instance_id,
        rank = rank.rank,
        active_instance_count = rank.active_instance_count,
        "computed instance rank"
    );

    let claimed = store
        .claim_orphaned_receptor_work(
            instance_id,
            rank.rank,
            rank.active_instance_count,
            config.lease_seconds,
            config.orphan_batch_size,
        )
        .await?;

    Ok((rank, claimed))
}

/// Whether `instance_id`, at `rank` among `active_instance_count` live
/// instances, currently owns `partition_number`. Exposed for callers that
/// want to filter in-memory before queuing a claim, not just after.
pub fn instance_owns_partition(partition_number: i32, rank: InstanceRank) -> bool {
    owns_partition(partition_number, rank.active_instance_count, rank.rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_instance_owns_every_partition() {
        let rank = InstanceRank {
            rank: 0,
            active_instance_count: 1,
        };
        for partition in 0..16 {
            assert!(instance_owns_partition(partition, rank));
        }
    }

    #[test]
    fn non_owning_rank_is_excluded() {
        let rank = InstanceRank {
            rank: 1,
            active_instance_count: 3,
        };
        assert!(!instance_owns_partition(0, rank));
        assert!(instance_owns_partition(1, rank));
    }
}
