//! Division of a contiguous range of work items among workers.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// The share of `total` items assigned to one worker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PartitionPlan {
    /// Number of items assigned
    pub share: u64,
    /// Zero-based offset of the first assigned item
    pub start_offset: u64,
    /// Set when the worker has nothing to do
    pub is_idle: bool,
}

impl PartitionPlan {
    /// Plan the share of worker `rank` out of `workers`.
    ///
    /// The first `total % workers` ranks receive one extra item. Shares are laid out in rank order
    /// so that the union of all plans covers `0..total` exactly once.
    pub fn plan(total: u64, workers: u64, rank: u64) -> Self {
        if workers == 0 {
            return PartitionPlan {
                share: 0,
                start_offset: total,
                is_idle: true,
            };
        }
        let start_offset = (0..rank).map(|r| share(total, workers, r)).sum();
        let share = share(total, workers, rank);
        PartitionPlan {
            share,
            start_offset,
            is_idle: share == 0 || start_offset >= total,
        }
    }

    /// Item offsets covered by this plan.
    pub fn range(&self) -> Range<u64> {
        self.start_offset..self.start_offset + self.share
    }
}

/// Plans of every rank, in rank order.
pub fn plan_all(total: u64, workers: u64) -> Vec<PartitionPlan> {
    (0..workers)
        .map(|rank| PartitionPlan::plan(total, workers, rank))
        .collect()
}

fn share(total: u64, workers: u64, rank: u64) -> u64 {
    let quotient = total / workers;
    let remainder = total % workers;
    if remainder != 0 && rank / remainder == 0 {
        quotient + 1
    } else {
        quotient
    }
}
