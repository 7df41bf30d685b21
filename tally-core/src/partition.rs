//! Fields grouping.
//!
//! Every key is mapped to exactly one partition by `stable_hash(key) % partition_count`.
//! `stable_hash` is FNV-1a 64 with the standard offset basis, so the mapping is identical on
//! every worker and across restarts. A redelivered record always lands on the partition
//! that saw it the first time, as long as `partition_count` is unchanged.
use std::hash::Hasher;

use anyhow::Result;
use fnv::FnvHasher;

use crate::error_bail;

/// Deterministic 64-bit hash of a key.
#[inline]
pub fn stable_hash(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Maps keys to partitions. `partition_count` is fixed for the lifetime of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    partition_count: usize,
}

impl Partitioner {
    pub fn new(partition_count: usize) -> Result<Self> {
        if partition_count == 0 {
            error_bail!("partition_count must be positive");
        }

        Ok(Self { partition_count })
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Partition id of `key`, in `0..partition_count`.
    #[inline]
    pub fn partition_of(&self, key: &str) -> usize {
        (stable_hash(key) % self.partition_count as u64) as usize
    }
}
