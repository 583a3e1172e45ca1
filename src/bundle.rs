//! Bundling of scenarios into combined subproblems
//!
//! ## Table of Contents
//! - **SubproblemKind**: Single scenario or extensive form
//! - **BundleMember**: One scenario inside a subproblem
//! - **Subproblem**: Unit handed to a solver
//! - **BundlingManager**: Forms subproblems from scenario sets

use crate::error::{PhError, Result};
use crate::registry::BundleSpec;
use crate::scenario::ScenarioTable;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a subproblem wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubproblemKind {
    /// One scenario, solved as is
    Scenario,
    /// Extensive form over several scenarios
    ExtensiveForm,
}

/// One scenario inside a subproblem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMember {
    /// Scenario name
    pub scenario: String,
    /// Position in the local scenario table
    pub key: usize,
    /// Objective scaling: member probability over subproblem probability
    pub objective_weight: f64,
}

/// A locally solved unit: one scenario or a bundle of whole scenarios.
///
/// Membership is fixed once formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subproblem {
    name: String,
    kind: SubproblemKind,
    probability: f64,
    members: Vec<BundleMember>,
    /// Objective bound from the last successful solve
    pub bound: Option<f64>,
    /// Last solve succeeded
    pub feasible: bool,
}

impl Subproblem {
    /// Subproblem name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of subproblem
    pub fn kind(&self) -> SubproblemKind {
        self.kind
    }

    /// Whether the subproblem wraps several scenarios
    pub fn is_bundle(&self) -> bool {
        self.kind == SubproblemKind::ExtensiveForm
    }

    /// Combined probability of the members
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Member scenarios
    pub fn members(&self) -> &[BundleMember] {
        &self.members
    }

    /// Whether `scenario` is a member
    pub fn contains(&self, scenario: &str) -> bool {
        self.members.iter().any(|m| m.scenario == scenario)
    }
}

/// Forms subproblems from sets of local scenarios
#[derive(Debug, Default, Clone, Copy)]
pub struct BundlingManager;

impl BundlingManager {
    /// Create a new manager
    pub fn new() -> Self {
        Self
    }

    /// Wrap one scenario as its own subproblem
    pub fn single(&self, scenarios: &ScenarioTable, scenario: &str) -> Result<Subproblem> {
        let key = scenarios
            .key(scenario)
            .ok_or_else(|| PhError::bundle(format!("scenario {} is not local", scenario)))?;
        Ok(Subproblem {
            name: scenario.to_string(),
            kind: SubproblemKind::Scenario,
            probability: scenarios.at(key).probability,
            members: vec![BundleMember {
                scenario: scenario.to_string(),
                key,
                objective_weight: 1.0,
            }],
            bound: None,
            feasible: false,
        })
    }

    /// Combine scenarios into one subproblem.
    ///
    /// An empty list or a non-local scenario is a bundle error. A single
    /// scenario comes back unwrapped as a plain scenario subproblem.
    pub fn form_bundle(&self, scenarios: &ScenarioTable, names: &[String], name: &str) -> Result<Subproblem> {
        match names {
            [] => Err(PhError::bundle(format!("empty scenario list for bundle {}", name))),
            [only] => {
                debug!(bundle = %name, scenario = %only, "Singleton bundle used unwrapped");
                self.single(scenarios, only)
            }
            _ => {
                let mut keys = Vec::with_capacity(names.len());
                for scenario in names {
                    let key = scenarios.key(scenario).ok_or_else(|| {
                        PhError::bundle(format!("bundle {} references non-local scenario {}", name, scenario))
                    })?;
                    if keys.contains(&key) {
                        return Err(PhError::bundle(format!(
                            "scenario {} listed twice in bundle {}",
                            scenario, name
                        )));
                    }
                    keys.push(key);
                }
                let probability: f64 = keys.iter().map(|&k| scenarios.at(k).probability).sum();
                if !(probability > 0.0) {
                    return Err(PhError::bundle(format!("bundle {} has no probability mass", name)));
                }
                let members = names
                    .iter()
                    .zip(keys)
                    .map(|(scenario, key)| BundleMember {
                        scenario: scenario.clone(),
                        key,
                        objective_weight: scenarios.at(key).probability / probability,
                    })
                    .collect();
                Ok(Subproblem {
                    name: name.to_string(),
                    kind: SubproblemKind::ExtensiveForm,
                    probability,
                    members,
                    bound: None,
                    feasible: false,
                })
            }
        }
    }

    /// Build the worker-local subproblem list
    pub fn subproblems(&self, scenarios: &ScenarioTable, bundles: &[BundleSpec]) -> Result<Vec<Subproblem>> {
        if bundles.is_empty() {
            return scenarios
                .iter()
                .map(|s| self.single(scenarios, &s.name))
                .collect();
        }

        let mut seen = std::collections::HashSet::new();
        let mut subproblems = Vec::with_capacity(bundles.len());
        for spec in bundles {
            for member in &spec.members {
                if !seen.insert(member.clone()) {
                    return Err(PhError::bundle(format!(
                        "scenario {} belongs to more than one bundle",
                        member
                    )));
                }
            }
            subproblems.push(self.form_bundle(scenarios, &spec.members, &spec.name)?);
        }
        if seen.len() != scenarios.len() {
            return Err(PhError::bundle(format!(
                "bundles cover {} of {} local scenarios",
                seen.len(),
                scenarios.len()
            )));
        }
        Ok(subproblems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioState;
    use crate::tree::ScenarioTree;

    fn table(probs: &[f64]) -> ScenarioTable {
        let names: Vec<String> = (0..probs.len()).map(|i| format!("scen{}", i)).collect();
        let tree = ScenarioTree::two_stage(vec!["x".into()], names.clone()).unwrap();
        let mut table = ScenarioTable::new();
        for (name, &p) in names.iter().zip(probs) {
            table.insert(ScenarioState::new(&tree, name, p, 1.0).unwrap()).unwrap();
        }
        table
    }

    #[test]
    fn test_empty_bundle_is_error() {
        let err = BundlingManager::new()
            .form_bundle(&table(&[1.0]), &[], "rank0bundle0")
            .unwrap_err();
        assert!(matches!(err, PhError::Bundle(_)));
    }

    #[test]
    fn test_singleton_is_unwrapped() {
        let sub = BundlingManager::new()
            .form_bundle(&table(&[0.5, 0.5]), &["scen1".to_string()], "rank0bundle0")
            .unwrap();
        assert_eq!(sub.kind(), SubproblemKind::Scenario);
        assert_eq!(sub.name(), "scen1");
        assert_eq!(sub.members()[0].objective_weight, 1.0);
    }

    #[test]
    fn test_extensive_form_scales_by_probability() {
        let scenarios = table(&[0.2, 0.3, 0.5]);
        let names = vec!["scen0".to_string(), "scen1".to_string()];
        let sub = BundlingManager::new()
            .form_bundle(&scenarios, &names, "rank0bundle0")
            .unwrap();
        assert!(sub.is_bundle());
        assert!((sub.probability() - 0.5).abs() < 1e-12);
        assert!((sub.members()[0].objective_weight - 0.4).abs() < 1e-12);
        assert!((sub.members()[1].objective_weight - 0.6).abs() < 1e-12);
        assert!(sub.contains("scen1"));
        assert!(!sub.contains("scen2"));
    }

    #[test]
    fn test_unknown_scenario_is_error() {
        let names = vec!["scen0".to_string(), "scen9".to_string()];
        let err = BundlingManager::new()
            .form_bundle(&table(&[0.5, 0.5]), &names, "b")
            .unwrap_err();
        assert!(matches!(err, PhError::Bundle(_)));
    }

    #[test]
    fn test_subproblems_without_bundles() {
        let subs = BundlingManager::new().subproblems(&table(&[0.5, 0.5]), &[]).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| !s.is_bundle()));
    }

    #[test]
    fn test_subproblems_reject_overlap() {
        let bundles = vec![
            BundleSpec { name: "b0".into(), members: vec!["scen0".into(), "scen1".into()] },
            BundleSpec { name: "b1".into(), members: vec!["scen1".into(), "scen2".into()] },
        ];
        let err = BundlingManager::new()
            .subproblems(&table(&[0.3, 0.3, 0.4]), &bundles)
            .unwrap_err();
        assert!(matches!(err, PhError::Bundle(_)));
    }
}
