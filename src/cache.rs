//! Save, fix and restore of non-anticipative variable state
//!
//! All operations walk slots in the order fixed by [`VariableIndex`], so a
//! cache written by `save` lines up with every later `restore` or `fix`.
//! Persistent solvers are notified per subproblem, after every member
//! scenario has been updated.
//!
//! ## Table of Contents
//! - **VariableStateCache**: save / restore / fix / original-state handling
//!
//! [`VariableIndex`]: crate::types::VariableIndex

use crate::bundle::Subproblem;
use crate::config::RefreshGranularity;
use crate::error::{PhError, Result};
use crate::scenario::{NonantCache, ScenarioState, ScenarioTable};
use crate::solve::{BoxedSolver, VariableUpdate};
use std::collections::HashMap;
use tracing::debug;

/// Per-scenario value and fixedness caches
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableStateCache {
    refresh: RefreshGranularity,
}

fn snapshot(s: &ScenarioState) -> NonantCache {
    NonantCache {
        values: s.slots.iter().map(|slot| slot.value).collect(),
        fixed: s.slots.iter().map(|slot| slot.fixed).collect(),
    }
}

fn check(s: &ScenarioState, cache: Option<&NonantCache>, what: &str) -> Result<()> {
    let cache = cache.ok_or_else(|| PhError::state(format!("no {} cache for scenario {}", what, s.name)))?;
    if cache.values.len() != s.slots.len() || cache.fixed.len() != s.slots.len() {
        return Err(PhError::state(format!(
            "{} cache of scenario {} holds {} entries for {} slots",
            what,
            s.name,
            cache.values.len(),
            s.slots.len()
        )));
    }
    Ok(())
}

fn apply(s: &mut ScenarioState, cache: &NonantCache) {
    for (i, slot) in s.slots.iter_mut().enumerate() {
        slot.value = cache.values[i];
        slot.fixed = cache.fixed[i];
    }
}

impl VariableStateCache {
    /// Create a cache service with the given persistent refresh granularity
    pub fn new(refresh: RefreshGranularity) -> Self {
        Self { refresh }
    }

    /// Snapshot every scenario's values and fixed status
    pub fn save(&self, scenarios: &mut ScenarioTable) {
        for s in scenarios.iter_mut() {
            s.cache = Some(snapshot(s));
        }
    }

    /// Snapshot the state of the run's first save; a second call is an error
    pub fn save_original(&self, scenarios: &mut ScenarioTable) -> Result<()> {
        if let Some(s) = scenarios.iter().find(|s| s.original.is_some()) {
            return Err(PhError::state(format!(
                "original state of scenario {} already saved",
                s.name
            )));
        }
        for s in scenarios.iter_mut() {
            s.original = Some(snapshot(s));
        }
        Ok(())
    }

    /// Write the saved cache back and re-push to persistent solvers.
    ///
    /// Every scenario's cache is checked before any slot changes.
    pub fn restore<M>(
        &self,
        scenarios: &mut ScenarioTable,
        subproblems: &[Subproblem],
        solvers: &mut [BoxedSolver<M>],
    ) -> Result<()> {
        for s in scenarios.iter() {
            check(s, s.cache.as_ref(), "saved")?;
        }
        for s in scenarios.iter_mut() {
            if let Some(cache) = s.cache.take() {
                apply(s, &cache);
                s.cache = Some(cache);
            }
        }
        self.push(scenarios, subproblems, solvers)
    }

    /// Fix slots at externally supplied per-node values.
    ///
    /// Requires a prior `save`. Every node of every local scenario must be
    /// present with exactly one value per slot; nothing is fixed otherwise.
    pub fn fix<M>(
        &self,
        scenarios: &mut ScenarioTable,
        values_by_node: &HashMap<String, Vec<f64>>,
        subproblems: &[Subproblem],
        solvers: &mut [BoxedSolver<M>],
    ) -> Result<()> {
        for s in scenarios.iter() {
            if s.cache.is_none() {
                return Err(PhError::state(format!("fix without a prior save for scenario {}", s.name)));
            }
            for node in &s.nodes {
                let supplied = values_by_node.get(&node.name).ok_or_else(|| {
                    PhError::state(format!("no fix values for node {} of scenario {}", node.name, s.name))
                })?;
                if supplied.is_empty() {
                    return Err(PhError::state(format!("empty fix values for node {}", node.name)));
                }
                if supplied.len() != node.len() {
                    return Err(PhError::state(format!(
                        "needed {} fix values for node {}, got {}",
                        node.len(),
                        node.name,
                        supplied.len()
                    )));
                }
            }
        }
        for s in scenarios.iter_mut() {
            for node in s.nodes.clone() {
                let supplied = &values_by_node[&node.name];
                for (slot, &v) in s.slots[node.range].iter_mut().zip(supplied) {
                    slot.value = v;
                    slot.fixed = true;
                }
            }
        }
        self.push(scenarios, subproblems, solvers)
    }

    /// Restore the state captured by `save_original`; not allowed while bundling
    pub fn restore_original<M>(
        &self,
        scenarios: &mut ScenarioTable,
        bundling: bool,
        subproblems: &[Subproblem],
        solvers: &mut [BoxedSolver<M>],
    ) -> Result<()> {
        if bundling {
            return Err(PhError::state("restoring original nonants is not supported with bundles"));
        }
        for s in scenarios.iter() {
            check(s, s.original.as_ref(), "original")?;
        }
        for s in scenarios.iter_mut() {
            if let Some(original) = s.original.take() {
                apply(s, &original);
                s.original = Some(original);
            }
        }
        self.push(scenarios, subproblems, solvers)
    }

    /// Keep current values but return fixed status to the run's original
    pub fn restore_original_fixedness<M>(
        &self,
        scenarios: &mut ScenarioTable,
        subproblems: &[Subproblem],
        solvers: &mut [BoxedSolver<M>],
    ) -> Result<()> {
        for s in scenarios.iter() {
            check(s, s.original.as_ref(), "original")?;
        }
        self.save(scenarios);
        for s in scenarios.iter_mut() {
            let fixed = s.original.as_ref().map(|o| o.fixed.clone());
            if let (Some(cache), Some(fixed)) = (s.cache.as_mut(), fixed) {
                cache.fixed = fixed;
            }
        }
        self.restore(scenarios, subproblems, solvers)
    }

    /// Overwrite the save caches from one flat vector in local slot order
    pub fn put_nonant_cache(&self, scenarios: &mut ScenarioTable, flat: &[f64]) -> Result<()> {
        let needed: usize = scenarios.iter().map(|s| s.slots.len()).sum();
        if flat.len() != needed {
            return Err(PhError::state(format!(
                "nonant cache list has {} entries, local slots need {}",
                flat.len(),
                needed
            )));
        }
        let mut offset = 0;
        for s in scenarios.iter_mut() {
            let n = s.slots.len();
            let values = flat[offset..offset + n].to_vec();
            offset += n;
            match s.cache.as_mut() {
                Some(cache) => cache.values = values,
                None => {
                    let fixed = s.slots.iter().map(|slot| slot.fixed).collect();
                    s.cache = Some(NonantCache { values, fixed });
                }
            }
        }
        Ok(())
    }

    /// Push current slot state of every member to its subproblem's persistent solver
    pub fn push<M>(
        &self,
        scenarios: &ScenarioTable,
        subproblems: &[Subproblem],
        solvers: &mut [BoxedSolver<M>],
    ) -> Result<()> {
        for (sub, solver) in subproblems.iter().zip(solvers.iter_mut()) {
            if !solver.is_persistent() {
                continue;
            }
            let updates: Vec<VariableUpdate> = sub
                .members()
                .iter()
                .flat_map(|member| {
                    let s = scenarios.at(member.key);
                    s.slots.iter().map(move |slot| VariableUpdate {
                        scenario: s.name.clone(),
                        index: slot.index.clone(),
                        value: slot.value,
                        fixed: slot.fixed,
                    })
                })
                .collect();
            match self.refresh {
                RefreshGranularity::Variable => {
                    for u in &updates {
                        solver.update_variable(&u.scenario, &u.index, u.value, u.fixed)?;
                    }
                }
                RefreshGranularity::Subproblem => solver.update_variables(&updates)?,
            }
            debug!(subproblem = %sub.name(), updates = updates.len(), "Persistent solver refreshed");
        }
        Ok(())
    }
}
