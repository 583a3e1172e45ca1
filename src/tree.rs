//! Scenario tree arena
//!
//! Nodes are stored in one arena and addressed by [`TreeNodeId`]; scenarios
//! hold the list of node ids on their path and nodes own nothing back. The
//! tree is built once at setup and is immutable afterwards.
//!
//! ## Table of Contents
//! - **TreeNode**: One stage node with conditional probability and slot names
//! - **ScenarioTree**: Node arena plus scenario paths
//! - **ScenarioTreeBuilder**: Validating builder

use crate::error::{PhError, Result};
use crate::types::VariableIndex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Name of the root node; every scenario path starts here
pub const ROOT: &str = "ROOT";

/// Arena index of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeNodeId(usize);

impl TreeNodeId {
    /// Arena position
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree-node-{}", self.0)
    }
}

/// A stage node of the scenario tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// Node name
    pub name: String,
    /// Parent node (None for ROOT)
    pub parent: Option<TreeNodeId>,
    /// Probability of this node given its parent
    pub cond_prob: f64,
    /// Stage number, one-based
    pub stage: usize,
    /// Ordered non-anticipative variable names
    pub variables: Vec<String>,
}

impl TreeNode {
    /// Number of non-anticipative slots at this node
    pub fn slot_count(&self) -> usize {
        self.variables.len()
    }

    /// Stable index of slot `position`
    pub fn index(&self, position: usize) -> VariableIndex {
        VariableIndex::new(self.name.clone(), position)
    }
}

/// Immutable scenario tree
#[derive(Debug, Clone)]
pub struct ScenarioTree {
    nodes: Vec<TreeNode>,
    by_name: HashMap<String, TreeNodeId>,
    scenarios: Vec<(String, Vec<TreeNodeId>)>,
    scenario_lookup: HashMap<String, usize>,
}

impl ScenarioTree {
    /// Start building a tree
    pub fn builder() -> ScenarioTreeBuilder {
        ScenarioTreeBuilder::default()
    }

    /// Two-stage tree: every scenario touches only ROOT
    pub fn two_stage<S: Into<String>>(
        variables: Vec<String>,
        scenario_names: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let mut builder = Self::builder().root(variables);
        for name in scenario_names {
            builder = builder.scenario(name, [ROOT]);
        }
        builder.build()
    }

    /// Node by id
    pub fn node(&self, id: TreeNodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Node id by name
    pub fn node_id(&self, name: &str) -> Option<TreeNodeId> {
        self.by_name.get(name).copied()
    }

    /// Node by name
    pub fn node_by_name(&self, name: &str) -> Option<&TreeNode> {
        self.node_id(name).map(|id| self.node(id))
    }

    /// All nodes in arena order
    pub fn nodes(&self) -> impl Iterator<Item = (TreeNodeId, &TreeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (TreeNodeId(i), n))
    }

    /// All scenario names in declaration order
    pub fn scenario_names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.iter().map(|(name, _)| name.as_str())
    }

    /// Number of scenarios
    pub fn scenario_count(&self) -> usize {
        self.scenarios.len()
    }

    /// Path of node ids for a scenario, ROOT first
    pub fn path(&self, scenario: &str) -> Result<&[TreeNodeId]> {
        self.scenario_lookup
            .get(scenario)
            .map(|&i| self.scenarios[i].1.as_slice())
            .ok_or_else(|| PhError::config(format!("unknown scenario {}", scenario)))
    }

    /// Whether a scenario's path contains the node
    pub fn touches(&self, scenario: &str, node: TreeNodeId) -> bool {
        self.path(scenario)
            .map(|p| p.contains(&node))
            .unwrap_or(false)
    }

    /// Stable slot indices of a scenario in path order
    pub fn variable_indices(&self, scenario: &str) -> Result<Vec<VariableIndex>> {
        let mut indices = Vec::new();
        for &id in self.path(scenario)? {
            let node = self.node(id);
            indices.extend((0..node.slot_count()).map(|i| node.index(i)));
        }
        Ok(indices)
    }
}

/// Builder for [`ScenarioTree`]
#[derive(Debug, Default)]
pub struct ScenarioTreeBuilder {
    nodes: Vec<(String, Option<String>, f64, Vec<String>)>,
    scenarios: Vec<(String, Vec<String>)>,
}

impl ScenarioTreeBuilder {
    /// Declare the ROOT node
    pub fn root(mut self, variables: Vec<String>) -> Self {
        self.nodes.push((ROOT.to_string(), None, 1.0, variables));
        self
    }

    /// Declare a child node
    pub fn child(
        mut self,
        name: impl Into<String>,
        parent: impl Into<String>,
        cond_prob: f64,
        variables: Vec<String>,
    ) -> Self {
        self.nodes
            .push((name.into(), Some(parent.into()), cond_prob, variables));
        self
    }

    /// Declare a scenario and its node path (ROOT first)
    pub fn scenario<I, S>(mut self, name: impl Into<String>, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scenarios
            .push((name.into(), path.into_iter().map(Into::into).collect()));
        self
    }

    /// Validate and build the tree
    pub fn build(self) -> Result<ScenarioTree> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut by_name = HashMap::new();

        for (name, parent, cond_prob, variables) in self.nodes {
            if by_name.contains_key(&name) {
                return Err(PhError::config(format!("duplicate tree node {}", name)));
            }
            if !(cond_prob > 0.0 && cond_prob <= 1.0) {
                return Err(PhError::config(format!(
                    "node {} has conditional probability {} outside (0, 1]",
                    name, cond_prob
                )));
            }
            let (parent_id, stage) = match &parent {
                None if name == ROOT => (None, 1),
                None => {
                    return Err(PhError::config(format!("node {} has no parent", name)));
                }
                Some(p) => {
                    let pid: TreeNodeId = *by_name.get(p).ok_or_else(|| {
                        PhError::config(format!("parent {} of node {} is not declared before it", p, name))
                    })?;
                    let parent_node: &TreeNode = &nodes[pid.0];
                    (Some(pid), parent_node.stage + 1)
                }
            };
            let id = TreeNodeId(nodes.len());
            nodes.push(TreeNode {
                name: name.clone(),
                parent: parent_id,
                cond_prob,
                stage,
                variables,
            });
            by_name.insert(name, id);
        }

        if !by_name.contains_key(ROOT) {
            return Err(PhError::config("scenario tree has no ROOT node"));
        }
        if self.scenarios.is_empty() {
            return Err(PhError::config("scenario tree has no scenarios"));
        }

        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        let mut scenario_lookup = HashMap::new();
        for (name, path) in self.scenarios {
            if scenario_lookup.contains_key(&name) {
                return Err(PhError::config(format!("duplicate scenario {}", name)));
            }
            let mut ids = Vec::with_capacity(path.len());
            for (depth, node_name) in path.iter().enumerate() {
                let id = *by_name.get(node_name).ok_or_else(|| {
                    PhError::config(format!("scenario {} references unknown node {}", name, node_name))
                })?;
                let expected_parent = if depth == 0 { None } else { Some(ids[depth - 1]) };
                if nodes[id.0].parent != expected_parent {
                    return Err(PhError::config(format!(
                        "scenario {} path is not a root-to-leaf chain at {}",
                        name, node_name
                    )));
                }
                ids.push(id);
            }
            if ids.is_empty() {
                return Err(PhError::config(format!("scenario {} has an empty path", name)));
            }
            // slots are looked up by variable name along the path
            let mut seen = HashSet::new();
            for id in &ids {
                let node = &nodes[id.0];
                if let Some(var) = node.variables.iter().find(|v| !seen.insert(v.as_str())) {
                    return Err(PhError::config(format!(
                        "variable {} is declared twice on the path of scenario {} (at node {})",
                        var, name, node.name
                    )));
                }
            }
            scenario_lookup.insert(name.clone(), scenarios.len());
            scenarios.push((name, ids));
        }

        Ok(ScenarioTree {
            nodes,
            by_name,
            scenarios,
            scenario_lookup,
        })
    }
}
