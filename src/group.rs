//! Worker groups and their collective operations.
//!
//! Every collective must be entered by all members of a group, in the same order. A member that
//! fails locally still takes part and reports the failure through the collective payload.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;
use tracing::warn;

/// Reduction applied by [Communicator::all_reduce]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub fn identity(self) -> i64 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Max => i64::MIN,
            ReduceOp::Min => i64::MAX,
        }
    }

    pub fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Sum => a.saturating_add(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// Message passing between the members of a worker group.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Zero-based rank of this member.
    fn rank(&self) -> usize;

    /// Number of members.
    fn size(&self) -> usize;

    /// Exchange one payload per member. Every member receives all payloads in rank order.
    async fn all_gather(&self, payload: Bytes) -> Vec<Bytes>;

    /// Wait until every member has arrived.
    async fn barrier(&self);

    /// Combine one value per member.
    async fn all_reduce(&self, value: i64, op: ReduceOp) -> i64 {
        let gathered = self
            .all_gather(Bytes::copy_from_slice(&value.to_le_bytes()))
            .await;
        gathered
            .iter()
            .filter_map(|payload| match <[u8; 8]>::try_from(payload.as_ref()) {
                Ok(raw) => Some(i64::from_le_bytes(raw)),
                Err(_) => {
                    warn!(len = payload.len(), "ignoring malformed reduction payload");
                    None
                }
            })
            .fold(op.identity(), |acc, value| op.combine(acc, value))
    }
}

#[derive(Debug)]
struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Bytes>>,
}

/// A group of tasks within one process, synchronised with a shared barrier.
#[derive(Clone, Debug)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Rendezvous>,
}

impl LocalGroup {
    /// Create the members of a group of `size` (at least one).
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let size = size.max(1);
        let shared = Arc::new(Rendezvous {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Bytes::new(); size]),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn store(&self, payload: Bytes) {
        let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(self.rank) {
            *slot = payload;
        }
    }

    fn snapshot(&self) -> Vec<Bytes> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_gather(&self, payload: Bytes) -> Vec<Bytes> {
        self.store(payload);
        self.shared.barrier.wait().await;
        let gathered = self.snapshot();
        // Nobody may overwrite a slot until everyone has read it.
        self.shared.barrier.wait().await;
        gathered
    }

    async fn barrier(&self) {
        self.shared.barrier.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_group<F, Fut, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalGroup::create(size)
            .into_iter()
            .map(|member| tokio::spawn(f(member)))
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn all_gather_in_rank_order() {
        let results = run_group(4, |member| async move {
            let payload = Bytes::from(format!("rank{}", member.rank()));
            member.all_gather(payload).await
        })
        .await;
        let expected: Vec<Bytes> = (0..4).map(|r| Bytes::from(format!("rank{r}"))).collect();
        for gathered in results {
            assert_eq!(expected, gathered);
        }
    }

    #[tokio::test]
    async fn all_reduce_operations() {
        let results = run_group(5, |member| async move {
            let value = member.rank() as i64 + 1;
            (
                member.all_reduce(value, ReduceOp::Sum).await,
                member.all_reduce(value, ReduceOp::Max).await,
                member.all_reduce(value, ReduceOp::Min).await,
            )
        })
        .await;
        assert!(results.iter().all(|r| *r == (15, 5, 1)));
    }

    #[tokio::test]
    async fn repeated_collectives_do_not_mix() {
        let results = run_group(3, |member| async move {
            let mut sums = Vec::new();
            for round in 0..10_i64 {
                sums.push(member.all_reduce(round * (member.rank() as i64), ReduceOp::Sum).await);
                member.barrier().await;
            }
            sums
        })
        .await;
        let expected: Vec<i64> = (0..10).map(|round| round * 3).collect();
        assert!(results.iter().all(|sums| *sums == expected));
    }

    #[tokio::test]
    async fn single_member_group() {
        let member = LocalGroup::create(0).remove(0);
        assert_eq!(1, member.size());
        assert_eq!(7, member.all_reduce(7, ReduceOp::Max).await);
    }

    #[test]
    fn identities() {
        for op in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min] {
            assert_eq!(42, op.combine(op.identity(), 42));
        }
    }
}
