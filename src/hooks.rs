//! Collaborator contracts consumed by the coordinator
//!
//! Absent collaborators are `None`, never queried.
//!
//! ## Table of Contents
//! - **IterationContext**: Read-only view of a worker during an iteration
//! - **CreatedScenario / ScenarioCreator**: Builds per-scenario models
//! - **ScenarioDenouement**: Per-scenario reporting at finalize
//! - **PhExtension**: Iteration hook points
//! - **RhoSetter**: Per-variable proximal coefficients after iteration 0

use crate::comm::ProcessGroup;
use crate::error::{PhError, Result};
use crate::scenario::ScenarioTable;
use crate::tree::ScenarioTree;
use std::collections::HashMap;

/// What collaborators can look at during an iteration
pub struct IterationContext<'a> {
    /// Current PH iteration
    pub iteration: usize,
    /// Worker-local scenarios
    pub scenarios: &'a ScenarioTable,
    /// Process group, for collaborators that need their own reductions
    pub group: &'a dyn ProcessGroup,
}

/// Output of the scenario creator for one scenario
#[derive(Debug, Clone)]
pub struct CreatedScenario<M> {
    /// Unconditional probability
    pub probability: f64,
    /// Scenario model handed to solvers
    pub model: M,
    /// Variable names per node, in the model's slot order.
    ///
    /// Nodes left out are taken from the tree; nodes present must list
    /// exactly the tree's names in the tree's order.
    pub variables: HashMap<String, Vec<String>>,
    /// Initial slot values per node (zero when absent)
    pub initial_values: HashMap<String, Vec<f64>>,
}

impl<M> CreatedScenario<M> {
    /// A scenario taking its variable layout from the tree
    pub fn new(probability: f64, model: M) -> Self {
        Self {
            probability,
            model,
            variables: HashMap::new(),
            initial_values: HashMap::new(),
        }
    }

    /// Declare a node's variable names as the model orders them
    pub fn with_variables(mut self, node: impl Into<String>, names: Vec<String>) -> Self {
        self.variables.insert(node.into(), names);
        self
    }

    /// Set initial values of a node's slots
    pub fn with_initial_values(mut self, node: impl Into<String>, values: Vec<f64>) -> Self {
        self.initial_values.insert(node.into(), values);
        self
    }

    /// Check the model's slot ordering against the tree
    pub fn verify_layout(&self, tree: &ScenarioTree, scenario: &str) -> Result<()> {
        let path = tree.path(scenario)?;
        for node in self.variables.keys().chain(self.initial_values.keys()) {
            let on_path = path.iter().any(|&id| tree.node(id).name == *node);
            if !on_path {
                return Err(PhError::state(format!(
                    "scenario {} reports node {} which is not on its path",
                    scenario, node
                )));
            }
        }
        for &id in path {
            let node = tree.node(id);
            if let Some(names) = self.variables.get(&node.name) {
                if *names != node.variables {
                    return Err(PhError::state(format!(
                        "scenario {} orders node {} as {:?}, tree has {:?}",
                        scenario, node.name, names, node.variables
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds the model of one scenario
pub trait ScenarioCreator<M>: Send + Sync {
    /// Create scenario `scenario`; `kwargs` are passed through unchanged
    fn create(&self, scenario: &str, kwargs: &serde_json::Value) -> Result<CreatedScenario<M>>;
}

impl<M, F> ScenarioCreator<M> for F
where
    F: Fn(&str, &serde_json::Value) -> Result<CreatedScenario<M>> + Send + Sync,
{
    fn create(&self, scenario: &str, kwargs: &serde_json::Value) -> Result<CreatedScenario<M>> {
        self(scenario, kwargs)
    }
}

/// Per-scenario reporting at finalize
pub trait ScenarioDenouement<M>: Send + Sync {
    /// Called once per local scenario
    fn denouement(&self, rank: usize, scenario: &str, model: &M);
}

impl<M, F> ScenarioDenouement<M> for F
where
    F: Fn(usize, &str, &M) + Send + Sync,
{
    fn denouement(&self, rank: usize, scenario: &str, model: &M) {
        self(rank, scenario, model)
    }
}

/// Hook points around the PH iteration; every hook defaults to a no-op
pub trait PhExtension: Send + Sync {
    /// Before any iteration-0 work
    fn pre_iter0(&mut self, _ctx: &IterationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After the iteration-0 solves and feasibility check
    fn post_iter0(&mut self, _ctx: &IterationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After the weight update and convergence measurement
    fn mid_iteration(&mut self, _ctx: &IterationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After the iteration's solves
    fn end_iteration(&mut self, _ctx: &IterationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After denouement, before the expected objective
    fn post_everything(&mut self, _ctx: &IterationContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Extension name for logging
    fn name(&self) -> &str;
}

/// Supplies per-variable proximal coefficients once after iteration 0
pub trait RhoSetter<M>: Send + Sync {
    /// `(variable name, rho)` pairs for one scenario.
    ///
    /// `kwargs` is the configured `rho_setter_kwargs` (`Null` when unset).
    fn rho_pairs(&self, scenario: &str, model: &M, kwargs: &serde_json::Value) -> Vec<(String, f64)>;
}

impl<M, F> RhoSetter<M> for F
where
    F: Fn(&str, &M, &serde_json::Value) -> Vec<(String, f64)> + Send + Sync,
{
    fn rho_pairs(&self, scenario: &str, model: &M, kwargs: &serde_json::Value) -> Vec<(String, f64)> {
        self(scenario, model, kwargs)
    }
}

/// Boxed extension
pub type BoxedExtension = Box<dyn PhExtension>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ROOT;

    fn tree() -> ScenarioTree {
        ScenarioTree::two_stage(vec!["x".into(), "y".into()], ["a", "b"]).unwrap()
    }

    #[test]
    fn test_layout_defaults_to_tree() {
        let created = CreatedScenario::new(0.5, ());
        assert!(created.verify_layout(&tree(), "a").is_ok());
    }

    #[test]
    fn test_layout_matching_order() {
        let created = CreatedScenario::new(0.5, ())
            .with_variables(ROOT, vec!["x".into(), "y".into()])
            .with_initial_values(ROOT, vec![1.0, 2.0]);
        assert!(created.verify_layout(&tree(), "b").is_ok());
    }

    #[test]
    fn test_layout_reordered_is_state_error() {
        let created = CreatedScenario::new(0.5, ()).with_variables(ROOT, vec!["y".into(), "x".into()]);
        assert!(matches!(created.verify_layout(&tree(), "a"), Err(PhError::State(_))));
    }

    #[test]
    fn test_layout_unknown_node_is_state_error() {
        let created = CreatedScenario::new(0.5, ()).with_initial_values("ROOT_7", vec![1.0]);
        assert!(matches!(created.verify_layout(&tree(), "a"), Err(PhError::State(_))));
    }

    #[test]
    fn test_closure_collaborators() {
        let creator = |name: &str, _kw: &serde_json::Value| -> Result<CreatedScenario<String>> {
            Ok(CreatedScenario::new(1.0, name.to_uppercase()))
        };
        let created = creator.create("a", &serde_json::Value::Null).unwrap();
        assert_eq!(created.model, "A");

        let setter = |_s: &str, _m: &String, kw: &serde_json::Value| {
            vec![("x".to_string(), kw["rho"].as_f64().unwrap_or(1.0))]
        };
        let kwargs = serde_json::json!({ "rho": 2.0 });
        assert_eq!(RhoSetter::rho_pairs(&setter, "a", &created.model, &kwargs), vec![("x".to_string(), 2.0)]);
        assert_eq!(
            RhoSetter::rho_pairs(&setter, "a", &created.model, &serde_json::Value::Null),
            vec![("x".to_string(), 1.0)]
        );
    }
}
