//! Core types for the PH engine
//!
//! ## Table of Contents
//! - **RunId**: Unique identifier for one PH run
//! - **VariableIndex**: Stable (node, position) address of a non-anticipative slot
//! - **SolverOptions**: Option set handed to subproblem solvers
//! - **SolveStatus**: Termination status reported by a solver
//! - **Termination**: Why the iteration loop stopped

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a PH run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", &self.0.to_string()[..8])
    }
}

/// Address of one non-anticipative variable slot.
///
/// The position is fixed when the tree is built and never changes for the
/// duration of a run; every cache, weight and xbar table is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableIndex {
    /// Tree node name
    pub node: String,
    /// Zero-based slot position within the node
    pub position: usize,
}

impl VariableIndex {
    /// Create a new variable index
    pub fn new(node: impl Into<String>, position: usize) -> Self {
        Self {
            node: node.into(),
            position,
        }
    }
}

impl fmt::Display for VariableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node, self.position)
    }
}

/// Solver option set (name -> value)
pub type SolverOptions = BTreeMap<String, serde_json::Value>;

/// Termination status of a subproblem solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Solved to optimality
    Optimal,
    /// Feasible but not proven optimal
    Feasible,
    /// Proven infeasible
    Infeasible,
    /// Unbounded
    Unbounded,
    /// Stopped on a limit (time, iterations)
    LimitReached,
    /// Solver reported an error
    Error,
}

impl SolveStatus {
    /// Only optimal termination counts as a successful solve
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Optimal)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Optimal => "optimal",
            Self::Feasible => "feasible",
            Self::Infeasible => "infeasible",
            Self::Unbounded => "unbounded",
            Self::LimitReached => "limit-reached",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Reason the PH iteration loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Convergence metric or user converger signalled convergence
    Converged,
    /// Hub coordinator signalled termination
    HubConverged,
    /// Iteration limit exhausted
    IterationLimit,
    /// Stopped through the cancel signal
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        assert!(id.to_string().starts_with("run-"));
    }

    #[test]
    fn test_variable_index_ordering() {
        let a = VariableIndex::new("ROOT", 1);
        let b = VariableIndex::new("ROOT", 0);
        let c = VariableIndex::new("ROOT_0", 0);
        let mut v = vec![c.clone(), a.clone(), b.clone()];
        v.sort();
        assert_eq!(v, vec![b, a, c]);
        assert_eq!(VariableIndex::new("ROOT", 2).to_string(), "ROOT[2]");
    }

    #[test]
    fn test_only_optimal_is_ok() {
        assert!(SolveStatus::Optimal.is_ok());
        assert!(!SolveStatus::Feasible.is_ok());
        assert!(!SolveStatus::Error.is_ok());
    }
}
