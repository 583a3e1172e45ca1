//! Subproblem registry
//!
//! Partitions the scenario list across workers in contiguous, as-even-as-
//! possible slices, optionally splits each worker's slice into bundles, and
//! derives the node-scoped communicators. Every worker computes the same
//! partition from the same inputs, so no communication is needed.
//!
//! ## Table of Contents
//! - **BundleSpec**: Fixed set of scenario names solved together
//! - **SubproblemRegistry**: Scenario → rank partition and bundle layout

use crate::comm::Communicator;
use crate::error::{PhError, Result};
use crate::tree::ScenarioTree;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use tracing::debug;

/// A fixed group of whole scenarios assigned to one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSpec {
    /// Bundle name (`rank{r}bundle{b}`)
    pub name: String,
    /// Member scenario names
    pub members: Vec<String>,
}

/// Scenario partition and bundle layout for a whole run
#[derive(Debug, Clone)]
pub struct SubproblemRegistry {
    size: usize,
    slices: Vec<Range<usize>>,
    names: Vec<String>,
    owner: HashMap<String, usize>,
    bundles: Vec<Vec<BundleSpec>>,
}

/// Split `n` items into `parts` contiguous slices whose lengths differ by at most one
fn even_slices(n: usize, parts: usize) -> Vec<Range<usize>> {
    let base = n / parts;
    let extra = n % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

impl SubproblemRegistry {
    /// Partition the tree's scenarios over `size` workers
    pub fn new(tree: &ScenarioTree, size: usize, bundles_per_rank: usize) -> Result<Self> {
        let names: Vec<String> = tree.scenario_names().map(str::to_string).collect();
        if size == 0 {
            return Err(PhError::config("process group is empty"));
        }
        if names.len() < size {
            return Err(PhError::config(format!(
                "{} scenarios cannot be spread over {} workers",
                names.len(),
                size
            )));
        }

        let slices = even_slices(names.len(), size);
        let mut owner = HashMap::new();
        for (rank, slice) in slices.iter().enumerate() {
            for name in &names[slice.clone()] {
                owner.insert(name.clone(), rank);
            }
        }

        let mut bundles = Vec::with_capacity(size);
        for (rank, slice) in slices.iter().enumerate() {
            if bundles_per_rank == 0 {
                bundles.push(Vec::new());
                continue;
            }
            if bundles_per_rank > slice.len() {
                return Err(PhError::config(format!(
                    "rank {} owns {} scenarios but {} bundles were requested",
                    rank,
                    slice.len(),
                    bundles_per_rank
                )));
            }
            let local = &names[slice.clone()];
            let specs = even_slices(local.len(), bundles_per_rank)
                .into_iter()
                .enumerate()
                .map(|(b, r)| BundleSpec {
                    name: format!("rank{}bundle{}", rank, b),
                    members: local[r].to_vec(),
                })
                .collect();
            bundles.push(specs);
        }

        debug!(scenarios = names.len(), workers = size, bundles_per_rank, "Scenario partition built");

        Ok(Self {
            size,
            slices,
            names,
            owner,
            bundles,
        })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Scenario names owned by `rank`
    pub fn local_scenarios(&self, rank: usize) -> &[String] {
        self.slices
            .get(rank)
            .map(|r| &self.names[r.clone()])
            .unwrap_or(&[])
    }

    /// Owning rank of a scenario
    pub fn rank_of(&self, scenario: &str) -> Option<usize> {
        self.owner.get(scenario).copied()
    }

    /// Bundles of `rank` (empty when bundling is off)
    pub fn bundles(&self, rank: usize) -> &[BundleSpec] {
        self.bundles.get(rank).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether bundles were formed
    pub fn bundling(&self) -> bool {
        self.bundles.iter().any(|b| !b.is_empty())
    }

    /// Communicator over exactly the ranks owning a scenario that touches `node`
    pub fn node_communicator(&self, tree: &ScenarioTree, node: &str) -> Result<Communicator> {
        let id = tree
            .node_id(node)
            .ok_or_else(|| PhError::config(format!("unknown tree node {}", node)))?;
        let members = self
            .names
            .iter()
            .filter(|s| tree.touches(s, id))
            .filter_map(|s| self.rank_of(s))
            .collect();
        Ok(Communicator::new(node, members))
    }

    /// Communicators for every node touched by `rank`'s scenarios
    pub fn communicators_for(&self, tree: &ScenarioTree, rank: usize) -> Result<HashMap<String, Communicator>> {
        let mut comms = HashMap::new();
        for scenario in self.local_scenarios(rank) {
            for &id in tree.path(scenario)? {
                let name = &tree.node(id).name;
                if !comms.contains_key(name) {
                    comms.insert(name.clone(), self.node_communicator(tree, name)?);
                }
            }
        }
        Ok(comms)
    }
}
