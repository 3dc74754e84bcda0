//! Partition assignment. `compute_partition` must return the same answer in
//! every process that calls it, since ownership (`partition_number mod
//! active_instance_count == rank`) is decided independently by each
//! instance against rows another instance may have written. `RandomState`
//! (the std `HashMap` default) reseeds per process and would make every
//! instance disagree; FNV-1a has no seed and is the same algorithm used for
//! the `__migrations` filename ordering's checksum input, so it's already a
//! known quantity in this codebase.

use uuid::Uuid;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `abs(hash(stream_id)) mod partition_count`. `partition_count` of zero has
/// no meaningful modulus and returns `None`, matching the null-propagation
/// the database-facing contract describes for a null `partition_count`.
pub fn compute_partition(stream_id: Uuid, partition_count: u32) -> Option<i32> {
    if partition_count == 0 {
        return None;
    }
    let hash = fnv1a(stream_id.as_bytes());
    Some((hash % partition_count as u64) as i32)
}

/// Whether `instance_rank` (0-based) is entitled to own `partition_number`
/// when `active_instance_count` instances are live.
pub fn owns_partition(partition_number: i32, active_instance_count: i64, instance_rank: i64) -> bool {
    if active_instance_count <= 0 {
        return false;
    }
    (partition_number as i64).rem_euclid(active_instance_count) == instance_rank
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn zero_partition_count_is_none() {
        assert_eq!(compute_partition(Uuid::new_v4(), 0), None);
    }

    #[test]
    fn same_stream_id_is_deterministic_across_calls() {
        let id = Uuid::new_v4();
        let a = compute_partition(id, 16);
        let b = compute_partition(id, 16);
        assert_eq!(a, b);
    }

    #[test]
    fn partition_is_always_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let id = Uuid::from_u128(rng.gen());
            let partition = compute_partition(id, 32).unwrap();
            assert!((0..32).contains(&partition));
        }
    }

    #[test]
    fn ownership_partitions_evenly_across_ranks() {
        let active_instance_count = 4;
        for partition_number in 0..64 {
            let owners: Vec<i64> = (0..active_instance_count)
                .filter(|rank| owns_partition(partition_number, active_instance_count, *rank))
                .collect();
            assert_eq!(owners.len(), 1, "exactly one rank owns each partition");
        }
    }
}
