//! # Progressive Hedging
//!
//! A Rust-native engine for the Progressive Hedging (PH) decomposition of
//! multi-stage stochastic programs. Scenarios are partitioned over a
//! process group; each worker solves its scenario subproblems and the
//! group agrees on per-node consensus values through scoped reductions.
//!
//! ## Features
//!
//! - **Scenario trees**: Nodes with non-anticipative variables and conditional probabilities
//! - **Consensus**: Node-scoped xbar/xsqbar reductions and W updates
//! - **Bundling**: Several scenarios per subproblem with rescaled objectives
//! - **Asynchronous mode**: Quorum-based xbar with a group-wide quit signal
//! - **Variable state cache**: Save, fix and restore of non-anticipative values
//! - **Metrics**: Prometheus-compatible per-worker metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use progressive_hedging::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> progressive_hedging::Result<()> {
//!     let config = Arc::new(PhConfig::from_file("ph.json")?);
//!     let tree = Arc::new(ScenarioTree::two_stage(vec!["x".into()], ["low", "high"])?);
//!     let creator: Arc<dyn ScenarioCreator<f64>> = Arc::new(
//!         |name: &str, _kw: &serde_json::Value| -> Result<CreatedScenario<f64>> {
//!             Ok(CreatedScenario::new(0.5, if name == "low" { 1.0 } else { 3.0 }))
//!         },
//!     );
//!     # let factory: Arc<dyn SolverFactory<f64>> = unimplemented!();
//!     let mut ph = PhCoordinator::builder(
//!         config,
//!         Arc::new(LocalProcessGroup::single()),
//!         tree,
//!         creator,
//!         factory,
//!     )
//!     .setup()
//!     .await?;
//!     let outcome = ph.ph_main().await?;
//!     println!("E[obj] = {}", outcome.expected_objective);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bundle;
pub mod cache;
pub mod comm;
pub mod config;
pub mod consensus;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod registry;
pub mod scenario;
pub mod solve;
pub mod synchronizer;
pub mod telemetry;
pub mod tree;
pub mod types;

// Re-exports for ergonomic API
pub use bundle::{BundleMember, BundlingManager, Subproblem, SubproblemKind};
pub use cache::VariableStateCache;
pub use comm::{BoxedProcessGroup, Communicator, LocalProcessGroup, ProcessGroup, ReduceOp};
pub use config::{AsyncSettings, PhConfig, PhConfigBuilder, RefreshGranularity};
pub use consensus::{ConsensusAggregator, NodeVectors, WeightUpdater};
pub use convergence::{BoxedConverger, BoxedHubCoordinator, ConvergenceMonitor, Converger, HubCoordinator};
pub use coordinator::{IterationState, Phase, PhCoordinator, PhCoordinatorBuilder, PhOutcome};
pub use error::{PhError, Result};
pub use hooks::{
    BoxedExtension, CreatedScenario, IterationContext, PhExtension, RhoSetter, ScenarioCreator,
    ScenarioDenouement,
};
pub use metrics::{PhMetrics, Timer};
pub use registry::{BundleSpec, SubproblemRegistry};
pub use scenario::{ScenarioState, ScenarioTable, SlotState};
pub use solve::{
    BoxedSolver, MemberSolution, MemberView, SolveLoop, SolveOutcome, SolveRequest, SolverFactory,
    SubproblemSolver, TermOverride,
};
pub use synchronizer::{AsyncSynchronizer, CancelSignal};
pub use tree::{ScenarioTree, TreeNode, TreeNodeId, ROOT};
pub use types::{RunId, SolveStatus, SolverOptions, Termination, VariableIndex};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::comm::{LocalProcessGroup, ProcessGroup};
    pub use crate::config::PhConfig;
    pub use crate::coordinator::{PhCoordinator, PhOutcome};
    pub use crate::error::{PhError, Result};
    pub use crate::hooks::{CreatedScenario, PhExtension, ScenarioCreator};
    pub use crate::solve::{SolveOutcome, SolveRequest, SolverFactory, SubproblemSolver};
    pub use crate::tree::ScenarioTree;
    pub use crate::types::{SolverOptions, Termination};
}
