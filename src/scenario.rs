//! Per-scenario PH state
//!
//! Each local scenario carries an explicit state record populated at setup:
//! slot values and fixed flags, weights, rho, xbar/xsqbar and the save
//! caches, all in the stable [`VariableIndex`] order of its tree path.
//!
//! ## Table of Contents
//! - **SlotState**: State of one non-anticipative slot
//! - **NodeSlots**: Slot range belonging to one tree node
//! - **NonantCache**: Saved values and fixed flags
//! - **ScenarioState**: Full record of one scenario
//! - **ScenarioTable**: Ordered worker-local scenario arena

use crate::error::{PhError, Result};
use crate::tree::{ScenarioTree, TreeNodeId};
use crate::types::VariableIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

/// State of one non-anticipative slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    /// Stable slot address
    pub index: VariableIndex,
    /// Variable name
    pub name: String,
    /// Current value
    pub value: f64,
    /// Whether the variable is fixed
    pub fixed: bool,
    /// Dual weight W
    pub w: f64,
    /// Proximal coefficient
    pub rho: f64,
    /// Node average of the slot
    pub xbar: f64,
    /// Node average of the squared slot
    pub xsqbar: f64,
}

/// Contiguous slot range belonging to one node of a scenario's path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSlots {
    /// Arena id
    pub id: TreeNodeId,
    /// Node name
    pub name: String,
    /// Conditional probability of the node
    pub cond_prob: f64,
    /// Slot positions inside [`ScenarioState::slots`]
    pub range: Range<usize>,
}

impl NodeSlots {
    /// Number of slots at the node
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the node has no slots
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Saved values and fixed flags in slot order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonantCache {
    /// Saved values
    pub values: Vec<f64>,
    /// Saved fixed flags
    pub fixed: Vec<bool>,
}

/// Full PH record of one scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioState {
    /// Scenario name
    pub name: String,
    /// Unconditional probability
    pub probability: f64,
    /// Path nodes with their slot ranges, ROOT first
    pub nodes: Vec<NodeSlots>,
    /// Slots in stable index order
    pub slots: Vec<SlotState>,
    /// W term active in the objective
    pub w_enabled: bool,
    /// Prox term active in the objective
    pub prox_enabled: bool,
    /// Last solve succeeded
    pub feasible: bool,
    /// Objective value from the last solve
    pub objective: Option<f64>,
    /// Cache written by `save`
    pub cache: Option<NonantCache>,
    /// State captured at the first save of the run
    pub original: Option<NonantCache>,
    #[serde(skip)]
    lookup: HashMap<VariableIndex, usize>,
    #[serde(skip)]
    names: HashMap<String, usize>,
}

impl ScenarioState {
    /// Build the record from the tree; W and prox start disabled
    pub fn new(
        tree: &ScenarioTree,
        name: impl Into<String>,
        probability: f64,
        default_rho: f64,
    ) -> Result<Self> {
        let name = name.into();
        let mut nodes = Vec::new();
        let mut slots = Vec::new();
        let mut lookup = HashMap::new();
        let mut names = HashMap::new();

        for &id in tree.path(&name)? {
            let node = tree.node(id);
            let start = slots.len();
            for (position, var) in node.variables.iter().enumerate() {
                let index = node.index(position);
                lookup.insert(index.clone(), slots.len());
                if names.insert(var.clone(), slots.len()).is_some() {
                    return Err(PhError::config(format!(
                        "variable {} appears twice on the path of scenario {}",
                        var, name
                    )));
                }
                slots.push(SlotState {
                    index,
                    name: var.clone(),
                    value: 0.0,
                    fixed: false,
                    w: 0.0,
                    rho: default_rho,
                    xbar: 0.0,
                    xsqbar: 0.0,
                });
            }
            nodes.push(NodeSlots {
                id,
                name: node.name.clone(),
                cond_prob: node.cond_prob,
                range: start..slots.len(),
            });
        }

        Ok(Self {
            name,
            probability,
            nodes,
            slots,
            w_enabled: false,
            prox_enabled: false,
            feasible: false,
            objective: None,
            cache: None,
            original: None,
            lookup,
            names,
        })
    }

    /// Slot position for a stable index
    pub fn position(&self, index: &VariableIndex) -> Option<usize> {
        self.lookup.get(index).copied()
    }

    /// Slot position for a variable name
    pub fn position_of_name(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Slot by stable index
    pub fn slot(&self, index: &VariableIndex) -> Option<&SlotState> {
        self.position(index).map(|p| &self.slots[p])
    }

    /// Mutable slot by stable index
    pub fn slot_mut(&mut self, index: &VariableIndex) -> Option<&mut SlotState> {
        self.position(index).map(move |p| &mut self.slots[p])
    }

    /// Node record by name
    pub fn node(&self, name: &str) -> Option<&NodeSlots> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Current values in slot order
    pub fn values(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.value).collect()
    }

    /// Overwrite slot values (solver results) in slot order
    pub fn set_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.slots.len() {
            return Err(PhError::state(format!(
                "scenario {} expects {} slot values, got {}",
                self.name,
                self.slots.len(),
                values.len()
            )));
        }
        for (slot, &v) in self.slots.iter_mut().zip(values) {
            slot.value = v;
        }
        Ok(())
    }

    /// Set initial values of one node's slots
    pub fn set_node_values(&mut self, node: &str, values: &[f64]) -> Result<()> {
        let range = self
            .node(node)
            .map(|n| n.range.clone())
            .ok_or_else(|| PhError::state(format!("scenario {} has no node {}", self.name, node)))?;
        if range.len() != values.len() {
            return Err(PhError::state(format!(
                "needed {} values for node {} of scenario {}, got {}",
                range.len(),
                node,
                self.name,
                values.len()
            )));
        }
        for (slot, &v) in self.slots[range].iter_mut().zip(values) {
            slot.value = v;
        }
        Ok(())
    }

    /// Rebuild lookup maps after deserialization
    pub fn reindex(&mut self) {
        self.lookup = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.index.clone(), i))
            .collect();
        self.names = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
    }
}

/// Ordered worker-local scenario arena
#[derive(Debug, Clone, Default)]
pub struct ScenarioTable {
    scenarios: Vec<ScenarioState>,
    lookup: HashMap<String, usize>,
}

impl ScenarioTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scenario; names must be unique
    pub fn insert(&mut self, state: ScenarioState) -> Result<usize> {
        if self.lookup.contains_key(&state.name) {
            return Err(PhError::config(format!("duplicate local scenario {}", state.name)));
        }
        let key = self.scenarios.len();
        self.lookup.insert(state.name.clone(), key);
        self.scenarios.push(state);
        Ok(key)
    }

    /// Position of a scenario
    pub fn key(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    /// Scenario by name
    pub fn get(&self, name: &str) -> Option<&ScenarioState> {
        self.key(name).map(|k| &self.scenarios[k])
    }

    /// Mutable scenario by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ScenarioState> {
        self.key(name).map(move |k| &mut self.scenarios[k])
    }

    /// Scenario by position
    pub fn at(&self, key: usize) -> &ScenarioState {
        &self.scenarios[key]
    }

    /// Mutable scenario by position
    pub fn at_mut(&mut self, key: usize) -> &mut ScenarioState {
        &mut self.scenarios[key]
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ScenarioState> {
        self.scenarios.iter()
    }

    /// Iterate mutably in insertion order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ScenarioState> {
        self.scenarios.iter_mut()
    }

    /// Number of local scenarios
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// Whether there are no local scenarios
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Local probability mass
    pub fn probability(&self) -> f64 {
        self.scenarios.iter().map(|s| s.probability).sum()
    }

    /// Enable or disable W and prox on every scenario
    pub fn set_terms(&mut self, w_enabled: bool, prox_enabled: bool) {
        for s in &mut self.scenarios {
            s.w_enabled = w_enabled;
            s.prox_enabled = prox_enabled;
        }
    }

    /// Enable or disable W on every scenario
    pub fn set_w_enabled(&mut self, enabled: bool) {
        for s in &mut self.scenarios {
            s.w_enabled = enabled;
        }
    }

    /// Enable or disable prox on every scenario
    pub fn set_prox_enabled(&mut self, enabled: bool) {
        for s in &mut self.scenarios {
            s.prox_enabled = enabled;
        }
    }
}
