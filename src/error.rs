//! Error types for the Progressive Hedging engine
//!
//! ## Table of Contents
//! - **PhError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, PhError>`

use thiserror::Error;

/// Result type alias for PH operations
pub type Result<T> = std::result::Result<T, PhError>;

/// Main error type for PH operations
#[derive(Error, Debug)]
pub enum PhError {
    /// A required option is missing or invalid, or no rho source exists
    #[error("configuration error: {0}")]
    Config(String),

    /// Ensemble probabilities do not sum to one within tolerance
    #[error("probability error: {0}")]
    Probability(String),

    /// Feasible probability mass does not match total probability
    #[error("infeasibility error: {0}")]
    Infeasibility(String),

    /// A single subproblem solve failed (recoverable)
    #[error("solve failure for {subproblem}: {reason}")]
    SolveFailure {
        /// Subproblem name
        subproblem: String,
        /// Solver status or error text
        reason: String,
    },

    /// Missing or length-mismatched cache entry for a node
    #[error("state error: {0}")]
    State(String),

    /// Empty or unknown bundle
    #[error("bundle error: {0}")]
    Bundle(String),

    /// Process-group collective failure
    #[error("communication error: {0}")]
    Communication(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl PhError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a probability error
    pub fn probability(msg: impl Into<String>) -> Self {
        Self::Probability(msg.into())
    }

    /// Create an infeasibility error
    pub fn infeasibility(msg: impl Into<String>) -> Self {
        Self::Infeasibility(msg.into())
    }

    /// Create a solve failure
    pub fn solve_failure(subproblem: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SolveFailure {
            subproblem: subproblem.into(),
            reason: reason.into(),
        }
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a bundle error
    pub fn bundle(msg: impl Into<String>) -> Self {
        Self::Bundle(msg.into())
    }

    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the run must stop on this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SolveFailure { .. })
    }
}

impl From<prometheus::Error> for PhError {
    fn from(err: prometheus::Error) -> Self {
        Self::Internal(format!("metrics: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_failure_is_recoverable() {
        let err = PhError::solve_failure("scen0", "infeasible");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "solve failure for scen0: infeasible");
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert!(PhError::probability("sum 0.9").is_fatal());
        assert!(PhError::state("missing ROOT").is_fatal());
        assert!(PhError::bundle("empty").is_fatal());
    }
}
