//! Consensus aggregation and dual weight updates
//!
//! ## Table of Contents
//! - **ConsensusAggregator**: Per-node xbar/xsqbar via node-scoped reductions
//! - **WeightUpdater**: `W ← W + rho (x − xbar)` on every local slot

use crate::comm::{Communicator, ProcessGroup, ReduceOp};
use crate::error::{PhError, Result};
use crate::scenario::ScenarioTable;
use crate::synchronizer::AsyncSynchronizer;
use crate::tree::ROOT;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Per-node concatenated vectors: sums in the first half, squares in the second
pub type NodeVectors = BTreeMap<String, Vec<f64>>;

/// Computes probability-weighted node averages across the process group
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    comms: HashMap<String, Communicator>,
}

impl ConsensusAggregator {
    /// Create an aggregator over the node communicators of this worker
    pub fn new(comms: HashMap<String, Communicator>) -> Self {
        Self { comms }
    }

    /// Communicator of a node
    pub fn communicator(&self, node: &str) -> Option<&Communicator> {
        self.comms.get(node)
    }

    /// Local weighted sums and sums of squares per node.
    ///
    /// Each scenario contributes with weight `probability / cond_prob` of
    /// the node. `root_extra` zero-filled slots are appended to the ROOT
    /// vector (one timestamp slot per worker in asynchronous runs).
    pub fn local_vectors(scenarios: &ScenarioTable, root_extra: usize) -> Result<NodeVectors> {
        let mut vectors = NodeVectors::new();
        let mut lens: HashMap<String, usize> = HashMap::new();

        for s in scenarios.iter() {
            for node in &s.nodes {
                let k = node.len();
                match lens.get(&node.name) {
                    Some(&known) if known != k => {
                        return Err(PhError::state(format!(
                            "node {} has {} slots in scenario {} but {} elsewhere",
                            node.name, k, s.name, known
                        )));
                    }
                    Some(_) => {}
                    None => {
                        lens.insert(node.name.clone(), k);
                        let extra = if node.name == ROOT { root_extra } else { 0 };
                        vectors.insert(node.name.clone(), vec![0.0; 2 * k + extra]);
                    }
                }

                let weight = s.probability / node.cond_prob;
                let concat = vectors
                    .get_mut(&node.name)
                    .ok_or_else(|| PhError::internal(format!("no vector for node {}", node.name)))?;
                for (i, slot) in s.slots[node.range.clone()].iter().enumerate() {
                    concat[i] += weight * slot.value;
                    concat[k + i] += weight * slot.value * slot.value;
                }
            }
        }
        Ok(vectors)
    }

    /// Compute xbar and xsqbar and store them in every local scenario.
    ///
    /// Without a synchronizer each node vector is sum-reduced over exactly
    /// the workers owning that node. With one, the vectors are posted to the
    /// contribution board and the quorum wait decides which aggregate is used.
    pub async fn compute_xbar(
        &self,
        group: &dyn ProcessGroup,
        scenarios: &mut ScenarioTable,
        synchronizer: Option<&AsyncSynchronizer>,
        verbose: bool,
    ) -> Result<NodeVectors> {
        let root_extra = if synchronizer.is_some() { group.size() } else { 0 };
        let local = Self::local_vectors(scenarios, root_extra)?;

        let global = match synchronizer {
            None => {
                let mut global = NodeVectors::new();
                for (node, vector) in &local {
                    let comm = self.comms.get(node).ok_or_else(|| {
                        PhError::communication(format!("no communicator for node {}", node))
                    })?;
                    let reduced = group.all_reduce(comm, ReduceOp::Sum, vector).await?;
                    global.insert(node.clone(), reduced);
                }
                global
            }
            Some(sync) => {
                let root_len = local
                    .get(ROOT)
                    .map(|v| (v.len() - root_extra) / 2)
                    .ok_or_else(|| PhError::state("no local scenario touches ROOT"))?;
                sync.exchange(group, local, root_len).await?
            }
        };

        Self::assign(scenarios, &global, group.rank(), verbose)?;
        Ok(global)
    }

    /// Write reduced node vectors into the scenarios' xbar/xsqbar
    pub fn assign(scenarios: &mut ScenarioTable, global: &NodeVectors, rank: usize, verbose: bool) -> Result<()> {
        for s in scenarios.iter_mut() {
            for node in &s.nodes {
                let k = node.len();
                let concat = global.get(&node.name).ok_or_else(|| {
                    PhError::state(format!("no aggregate for node {} of scenario {}", node.name, s.name))
                })?;
                if concat.len() < 2 * k {
                    return Err(PhError::state(format!(
                        "aggregate for node {} has {} entries, needs {}",
                        node.name,
                        concat.len(),
                        2 * k
                    )));
                }
                for (i, slot) in s.slots[node.range.clone()].iter_mut().enumerate() {
                    slot.xbar = concat[i];
                    slot.xsqbar = concat[k + i];
                    if verbose && rank == 0 {
                        debug!(scenario = %s.name, slot = %slot.index, var = %slot.name, xbar = slot.xbar, "xbar");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Applies the dual ascent step on every local slot
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightUpdater;

impl WeightUpdater {
    /// Create a new updater
    pub fn new() -> Self {
        Self
    }

    /// `W ← W + rho (x − xbar)`; assumes xbar is fresh
    pub fn update(&self, scenarios: &mut ScenarioTable, rank: usize, verbose: bool) {
        for s in scenarios.iter_mut() {
            for slot in &mut s.slots {
                slot.w += slot.rho * (slot.value - slot.xbar);
                if verbose && rank == 0 {
                    debug!(scenario = %s.name, slot = %slot.index, var = %slot.name, w = slot.w, "W");
                }
            }
        }
    }
}
