//! Shard planning: which slice of the ordered test set a worker owns

use std::ops::Range;

use crate::config::{MAX_RECOMMENDED_SHARDS, TESTS_PER_SHARD};
use crate::error::{CoordinationError, CoordinationResult};

/// A worker's externally assigned position in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTask {
    pub index: u32,
    pub total_count: u32,
}

impl WorkerTask {
    pub fn new(index: u32, total_count: u32) -> CoordinationResult<Self> {
        if total_count == 0 {
            return Err(CoordinationError::config("total worker count must be at least 1"));
        }
        if index >= total_count {
            return Err(CoordinationError::config(format!(
                "worker index {} is outside [0, {})",
                index, total_count
            )));
        }
        Ok(Self { index, total_count })
    }

    /// Worker 0 coordinates the merge
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }
}

/// One worker's partition of the test set
///
/// The executor receives the one-based `i/N` form; `range` and `select`
/// describe the same balanced contiguous split over an explicit list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub index: u32,
    pub total: u32,
}

impl ShardSpec {
    /// One-based shard number as used by `--shard=i/N`
    pub fn one_based(&self) -> u32 {
        self.index + 1
    }

    /// Shard argument in `i/N` form
    pub fn shard_arg(&self) -> String {
        format!("{}/{}", self.one_based(), self.total)
    }

    /// Contiguous range of a `len`-element ordered set owned by this shard
    ///
    /// The first `len % total` shards receive one extra element, so sizes
    /// differ by at most one.
    pub fn range(&self, len: usize) -> Range<usize> {
        let total = self.total as usize;
        let index = self.index as usize;
        let base = len / total;
        let extra = len % total;

        let start = index * base + index.min(extra);
        let size = base + usize::from(index < extra);
        start..start + size
    }

    pub fn select<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[self.range(items.len())]
    }
}

/// Partition the work for `task`; pure, no I/O
pub fn plan(task: WorkerTask) -> ShardSpec {
    ShardSpec {
        index: task.index,
        total: task.total_count,
    }
}

/// Suggested worker count for a suite of `test_count` tests
pub fn recommended_shard_count(test_count: usize) -> usize {
    test_count
        .div_ceil(TESTS_PER_SHARD)
        .clamp(1, MAX_RECOMMENDED_SHARDS)
}
