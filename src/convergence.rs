//! Convergence evaluation
//!
//! Precedence, highest first: an external hub coordinator, a user-supplied
//! converger, the built-in L1 metric.
//!
//! ## Table of Contents
//! - **Converger**: Pluggable convergence test
//! - **HubCoordinator**: Hub-level sync and veto
//! - **ConvergenceMonitor**: Measures and decides once per iteration

use crate::comm::{all_reduce_scalar, ProcessGroup, ReduceOp};
use crate::error::Result;
use crate::hooks::IterationContext;
use crate::scenario::ScenarioTable;
use crate::types::Termination;
use async_trait::async_trait;
use tracing::{debug, info};

/// User-supplied convergence test
#[async_trait]
pub trait Converger: Send + Sync {
    /// Value reported as the iteration's convergence metric
    async fn convergence_value(&mut self, ctx: &IterationContext<'_>) -> Result<f64>;

    /// Whether the run has converged
    async fn is_converged(&mut self, ctx: &IterationContext<'_>) -> Result<bool>;

    /// Converger name for logging
    fn name(&self) -> &str;
}

/// Hub-level coordinator consumed by the iteration loop
#[async_trait]
pub trait HubCoordinator: Send + Sync {
    /// Exchange data with the hub
    async fn sync(&mut self, ctx: &IterationContext<'_>) -> Result<()>;

    /// Hub-level termination; overrides every local test
    async fn is_converged(&mut self) -> Result<bool>;

    /// Coordinator name for logging
    fn name(&self) -> &str;
}

/// Boxed converger
pub type BoxedConverger = Box<dyn Converger>;

/// Boxed hub coordinator
pub type BoxedHubCoordinator = Box<dyn HubCoordinator>;

/// Built-in metric and the collaborator precedence chain
pub struct ConvergenceMonitor {
    threshold: f64,
    converger: Option<BoxedConverger>,
    hub: Option<BoxedHubCoordinator>,
}

impl ConvergenceMonitor {
    /// Create a monitor with the built-in metric only
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            converger: None,
            hub: None,
        }
    }

    /// Use a custom converger instead of the built-in metric
    pub fn with_converger(mut self, converger: Option<BoxedConverger>) -> Self {
        self.converger = converger;
        self
    }

    /// Attach a hub coordinator
    pub fn with_hub(mut self, hub: Option<BoxedHubCoordinator>) -> Self {
        self.hub = hub;
        self
    }

    /// Whether a hub coordinator is attached
    pub fn has_hub(&self) -> bool {
        self.hub.is_some()
    }

    /// Local `Σ|x − xbar|` over every scenario slot, divided by the slot count
    pub fn local_metric(scenarios: &ScenarioTable) -> f64 {
        let mut diff = 0.0;
        let mut count = 0usize;
        for s in scenarios.iter() {
            for slot in &s.slots {
                diff += (slot.value - slot.xbar).abs();
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            diff / count as f64
        }
    }

    /// Built-in metric: local metric sum-reduced over the group, divided by its size
    pub async fn convergence_diff(group: &dyn ProcessGroup, scenarios: &ScenarioTable) -> Result<f64> {
        let local = Self::local_metric(scenarios);
        let total = all_reduce_scalar(group, ReduceOp::Sum, local).await?;
        Ok(total / group.size() as f64)
    }

    /// Measure this iteration's convergence value.
    ///
    /// `None` when no value is available (asynchronous runs without a
    /// converger skip the blocking built-in reduction).
    pub async fn measure(&mut self, ctx: &IterationContext<'_>, asynchronous: bool) -> Result<Option<f64>> {
        if let Some(converger) = self.converger.as_mut() {
            let value = converger.convergence_value(ctx).await?;
            debug!(iteration = ctx.iteration, converger = %converger.name(), value, "Converger value");
            return Ok(Some(value));
        }
        if asynchronous {
            return Ok(None);
        }
        Self::convergence_diff(ctx.group, ctx.scenarios).await.map(Some)
    }

    /// Decide whether to stop, in precedence order
    pub async fn decide(&mut self, ctx: &IterationContext<'_>, metric: Option<f64>) -> Result<Option<Termination>> {
        if let Some(hub) = self.hub.as_mut() {
            hub.sync(ctx).await?;
            if hub.is_converged().await? {
                if ctx.group.rank() == 0 {
                    info!(iteration = ctx.iteration, hub = %hub.name(), "Hub signalled convergence");
                }
                return Ok(Some(Termination::HubConverged));
            }
        }

        if let Some(converger) = self.converger.as_mut() {
            if converger.is_converged(ctx).await? {
                if ctx.group.rank() == 0 {
                    info!(iteration = ctx.iteration, converger = %converger.name(), "User converger signalled convergence");
                }
                return Ok(Some(Termination::Converged));
            }
            return Ok(None);
        }

        match metric {
            Some(conv) if conv < self.threshold => {
                if ctx.group.rank() == 0 {
                    info!(iteration = ctx.iteration, conv, threshold = self.threshold, "Convergence metric below threshold");
                }
                Ok(Some(Termination::Converged))
            }
            _ => Ok(None),
        }
    }
}
