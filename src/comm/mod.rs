//! Process-group layer
//!
//! Every distributed operation of the engine goes through [`ProcessGroup`]:
//! sum/min/max all-reduce scoped to a [`Communicator`], gather to a root,
//! barriers, a non-blocking contribution board used by the asynchronous
//! variant, and a group-wide quit signal.
//!
//! ## Table of Contents
//! - **ReduceOp**: Element-wise reduction operator
//! - **Communicator**: Named subset of workers taking part in a collective
//! - **ProcessGroup**: Collective primitives trait
//! - **LocalProcessGroup**: In-memory implementation (see [`local`])

pub mod local;

use crate::error::Result;
use crate::synchronizer::CancelSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalProcessGroup;

/// Label of the whole-group communicator
pub const WORLD: &str = "world";

/// Element-wise reduction operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum
    Sum,
    /// Element-wise minimum
    Min,
    /// Element-wise maximum
    Max,
}

impl ReduceOp {
    /// Combine `other` into `acc`
    pub fn combine(&self, acc: &mut [f64], other: &[f64]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                Self::Sum => *a + b,
                Self::Min => a.min(b),
                Self::Max => a.max(b),
            };
        }
    }
}

/// A named set of worker ranks taking part in a collective.
///
/// Node-scoped communicators contain exactly the ranks that own a scenario
/// touching the node, so a reduction never mixes in values from workers
/// outside the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Communicator {
    /// Label shared by every member
    pub label: String,
    /// Sorted member ranks
    pub members: Vec<usize>,
}

impl Communicator {
    /// Create a communicator; members are sorted and deduplicated
    pub fn new(label: impl Into<String>, mut members: Vec<usize>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self {
            label: label.into(),
            members,
        }
    }

    /// Communicator spanning every rank
    pub fn world(size: usize) -> Self {
        Self::new(WORLD, (0..size).collect())
    }

    /// Whether `rank` is a member
    pub fn contains(&self, rank: usize) -> bool {
        self.members.binary_search(&rank).is_ok()
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Collective primitives over a group of cooperating workers
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// This worker's rank
    fn rank(&self) -> usize;

    /// Number of workers in the group
    fn size(&self) -> usize;

    /// Element-wise reduction across the communicator's members
    async fn all_reduce(&self, comm: &Communicator, op: ReduceOp, local: &[f64]) -> Result<Vec<f64>>;

    /// Gather one value per rank on `root`; `None` on every other rank
    async fn gather(&self, root: usize, value: serde_json::Value) -> Result<Option<Vec<serde_json::Value>>>;

    /// Block until every rank has arrived
    async fn barrier(&self) -> Result<()>;

    /// Post (replace) this worker's contribution under `key` without waiting
    fn post_contribution(&self, key: &str, contribution: Vec<f64>) -> Result<()>;

    /// Sum of the latest contribution of every worker that posted under `key`
    fn read_contributions(&self, key: &str, len: usize) -> Result<Vec<f64>>;

    /// Quit signal shared by every member of the group
    fn quit_signal(&self) -> CancelSignal;

    /// Abort signal shared by every member of the group.
    ///
    /// Raised when a worker hits a fatal error. Pending and later
    /// collectives fail on every member once it is raised.
    fn abort_signal(&self) -> CancelSignal;

    /// Group name for logging
    fn name(&self) -> &str;
}

/// Shared process group handle
pub type BoxedProcessGroup = Arc<dyn ProcessGroup>;

/// Sum-reduce a scalar over the whole group
pub async fn all_reduce_scalar(
    group: &dyn ProcessGroup,
    op: ReduceOp,
    value: f64,
) -> Result<f64> {
    let world = Communicator::world(group.size());
    let reduced = group.all_reduce(&world, op, &[value]).await?;
    Ok(reduced.first().copied().unwrap_or(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        let mut acc = vec![1.0, 5.0];
        ReduceOp::Sum.combine(&mut acc, &[2.0, -1.0]);
        assert_eq!(acc, vec![3.0, 4.0]);
        ReduceOp::Min.combine(&mut acc, &[0.0, 9.0]);
        assert_eq!(acc, vec![0.0, 4.0]);
        ReduceOp::Max.combine(&mut acc, &[1.0, 2.0]);
        assert_eq!(acc, vec![1.0, 4.0]);
    }

    #[test]
    fn test_communicator_members() {
        let comm = Communicator::new("ROOT_0", vec![3, 1, 3]);
        assert_eq!(comm.members, vec![1, 3]);
        assert!(comm.contains(3));
        assert!(!comm.contains(2));
        assert_eq!(Communicator::world(4).size(), 4);
    }
}
