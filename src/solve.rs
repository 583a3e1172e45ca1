//! Subproblem solver contract and the solve loop
//!
//! ## Table of Contents
//! - **SubproblemSolver**: Capability wrapping one external solver handle
//! - **SolverFactory**: Creates a handle per local subproblem
//! - **SolveRequest**: What a solver sees: member models plus PH terms
//! - **SolveOutcome**: Status, bound and per-member solutions
//! - **SolveLoop**: Solves every local subproblem and absorbs failures

use crate::bundle::{Subproblem, SubproblemKind};
use crate::error::{PhError, Result};
use crate::metrics::{PhMetrics, Timer};
use crate::scenario::ScenarioTable;
use crate::types::{SolveStatus, SolverOptions, VariableIndex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// PH terms of one non-anticipative slot as seen by the solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotTerm {
    /// Stable slot identifier
    pub index: VariableIndex,
    /// Variable name
    pub name: String,
    /// Current value (warm start, or the fixed value)
    pub value: f64,
    /// Whether the variable is fixed at `value`
    pub fixed: bool,
    /// Dual weight
    pub w: f64,
    /// Proximal coefficient
    pub rho: f64,
    /// Node average
    pub xbar: f64,
}

/// One member scenario of a solve request
#[derive(Debug)]
pub struct MemberView<'a, M> {
    /// Scenario name
    pub scenario: &'a str,
    /// Scenario model built by the scenario creator
    pub model: &'a M,
    /// Objective scaling (member probability / subproblem probability)
    pub objective_weight: f64,
    /// Whether the `W·x` term is active
    pub w_enabled: bool,
    /// Whether the proximal term is active
    pub prox_enabled: bool,
    /// Slot terms in slot order
    pub slots: Vec<SlotTerm>,
}

/// Everything a solver needs for one subproblem solve
#[derive(Debug)]
pub struct SolveRequest<'a, M> {
    /// Subproblem name
    pub subproblem: &'a str,
    /// Single scenario or extensive form
    pub kind: SubproblemKind,
    /// PH iteration (0 for iteration zero)
    pub iteration: usize,
    /// Echo solver output
    pub tee: bool,
    /// Member scenarios
    pub members: Vec<MemberView<'a, M>>,
}

/// Solved values of one member scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSolution {
    /// Scenario name
    pub scenario: String,
    /// Values in slot order
    pub values: Vec<f64>,
    /// Scenario objective value (unscaled)
    pub objective: f64,
}

/// Result of one solve call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    /// Termination status
    pub status: SolveStatus,
    /// Objective bound of the whole subproblem, if the solver reports one
    pub objective_bound: Option<f64>,
    /// Per-member solutions
    pub members: Vec<MemberSolution>,
    /// Free-form termination detail for diagnostics
    pub detail: Option<String>,
}

impl SolveOutcome {
    /// Optimal outcome without a separate bound
    pub fn optimal(members: Vec<MemberSolution>) -> Self {
        Self {
            status: SolveStatus::Optimal,
            objective_bound: None,
            members,
            detail: None,
        }
    }

    /// Failed outcome with a status and detail
    pub fn failed(status: SolveStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            objective_bound: None,
            members: Vec::new(),
            detail: Some(detail.into()),
        }
    }
}

/// One slot update pushed to a persistent solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    /// Owning scenario
    pub scenario: String,
    /// Slot identifier
    pub index: VariableIndex,
    /// New value
    pub value: f64,
    /// New fixed status
    pub fixed: bool,
}

/// Handle to an external solver for one subproblem
pub trait SubproblemSolver<M>: Send + Sync {
    /// Solve the subproblem. Errors other than `SolveFailure` abort the run.
    fn solve(&mut self, request: &SolveRequest<'_, M>, options: &SolverOptions) -> Result<SolveOutcome>;

    /// Whether the handle keeps model state between solves
    fn is_persistent(&self) -> bool {
        false
    }

    /// Re-synchronize the objective (W and prox terms) before a solve
    fn sync_objective(&mut self, _request: &SolveRequest<'_, M>) -> Result<()> {
        Ok(())
    }

    /// Push one variable's value and fixed status
    fn update_variable(&mut self, _scenario: &str, _index: &VariableIndex, _value: f64, _fixed: bool) -> Result<()> {
        Ok(())
    }

    /// Push a batch of variable updates
    fn update_variables(&mut self, updates: &[VariableUpdate]) -> Result<()> {
        for u in updates {
            self.update_variable(&u.scenario, &u.index, u.value, u.fixed)?;
        }
        Ok(())
    }

    /// Solver name for logging
    fn name(&self) -> &str;
}

/// Boxed solver handle
pub type BoxedSolver<M> = Box<dyn SubproblemSolver<M>>;

/// Creates solver handles for local subproblems
pub trait SolverFactory<M>: Send + Sync {
    /// Create a handle for `subproblem` using the configured solver name
    fn create(&self, solver_name: &str, subproblem: &Subproblem) -> Result<BoxedSolver<M>>;
}

impl<M, F> SolverFactory<M> for F
where
    F: Fn(&str, &Subproblem) -> Result<BoxedSolver<M>> + Send + Sync,
{
    fn create(&self, solver_name: &str, subproblem: &Subproblem) -> Result<BoxedSolver<M>> {
        self(solver_name, subproblem)
    }
}

/// Which PH terms to drop for a solve pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermOverride {
    /// Drop the `W·x` term
    pub disable_w: bool,
    /// Drop the proximal term
    pub disable_prox: bool,
}

impl TermOverride {
    /// Keep both terms as configured on the scenarios
    pub fn none() -> Self {
        Self::default()
    }

    /// Drop both terms
    pub fn both() -> Self {
        Self {
            disable_w: true,
            disable_prox: true,
        }
    }

    /// Drop only the proximal term
    pub fn prox_only() -> Self {
        Self {
            disable_w: false,
            disable_prox: true,
        }
    }
}

/// Build the solver request for one subproblem
pub fn build_request<'a, M>(
    subproblem: &'a Subproblem,
    scenarios: &'a ScenarioTable,
    models: &'a [M],
    iteration: usize,
    tee: bool,
    terms: TermOverride,
) -> Result<SolveRequest<'a, M>> {
    let members = subproblem
        .members()
        .iter()
        .map(|member| {
            let state = scenarios.at(member.key);
            let model = models.get(member.key).ok_or_else(|| {
                PhError::internal(format!("no model for scenario {}", member.scenario))
            })?;
            Ok(MemberView {
                scenario: state.name.as_str(),
                model,
                objective_weight: member.objective_weight,
                w_enabled: state.w_enabled && !terms.disable_w,
                prox_enabled: state.prox_enabled && !terms.disable_prox,
                slots: state
                    .slots
                    .iter()
                    .map(|s| SlotTerm {
                        index: s.index.clone(),
                        name: s.name.clone(),
                        value: s.value,
                        fixed: s.fixed,
                        w: s.w,
                        rho: s.rho,
                        xbar: s.xbar,
                    })
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(SolveRequest {
        subproblem: subproblem.name(),
        kind: subproblem.kind(),
        iteration,
        tee,
        members,
    })
}

/// Per-pass solve accounting
#[derive(Debug, Clone, Default)]
pub struct SolveReport {
    /// Wall time per subproblem, in local order
    pub durations: Vec<(String, Duration)>,
    /// Subproblems whose solve failed
    pub failures: Vec<String>,
}

impl SolveReport {
    /// Total solve time of the pass
    pub fn total(&self) -> Duration {
        self.durations.iter().map(|(_, d)| *d).sum()
    }
}

/// Solves every local subproblem once
pub struct SolveLoop<'a> {
    rank: usize,
    tee_rank0: bool,
    metrics: Option<&'a Arc<PhMetrics>>,
}

impl<'a> SolveLoop<'a> {
    /// Create a loop for `rank`
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            tee_rank0: false,
            metrics: None,
        }
    }

    /// Echo rank 0 solver output
    pub fn tee_rank0(mut self, enabled: bool) -> Self {
        self.tee_rank0 = enabled;
        self
    }

    /// Record solve metrics
    pub fn with_metrics(mut self, metrics: Option<&'a Arc<PhMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Solve all subproblems.
    ///
    /// A failed or non-optimal solve marks the subproblem and all of its
    /// members infeasible and the pass continues, including when the solver
    /// handle itself returns an error. `gripe` turns failures into warnings.
    #[allow(clippy::too_many_arguments)]
    pub fn run<M>(
        &self,
        subproblems: &mut [Subproblem],
        solvers: &mut [BoxedSolver<M>],
        scenarios: &mut ScenarioTable,
        models: &[M],
        options: &SolverOptions,
        iteration: usize,
        terms: TermOverride,
        gripe: bool,
    ) -> Result<SolveReport> {
        if solvers.len() != subproblems.len() {
            return Err(PhError::internal(format!(
                "{} solver handles for {} subproblems",
                solvers.len(),
                subproblems.len()
            )));
        }

        let tee = self.tee_rank0 && self.rank == 0;
        let mut report = SolveReport::default();

        for (sub, solver) in subproblems.iter_mut().zip(solvers.iter_mut()) {
            let timer = Timer::start();
            let attempt = {
                let request = build_request(sub, scenarios, models, iteration, tee, terms)?;
                let synced = if solver.is_persistent() {
                    solver.sync_objective(&request)
                } else {
                    Ok(())
                };
                synced.and_then(|()| solver.solve(&request, options))
            };
            let elapsed = timer.stop();

            let failure = match attempt {
                Ok(outcome) if outcome.status.is_ok() => {
                    Self::absorb(sub, scenarios, outcome)?;
                    None
                }
                Ok(outcome) => Some(match outcome.detail {
                    Some(detail) => format!("status {}: {}", outcome.status, detail),
                    None => format!("status {}", outcome.status),
                }),
                Err(PhError::SolveFailure { reason, .. }) => Some(reason),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                sub.feasible = false;
                for member in sub.members() {
                    scenarios.at_mut(member.key).feasible = false;
                }
                if gripe {
                    warn!(
                        rank = self.rank,
                        iteration,
                        subproblem = %sub.name(),
                        solver = %solver.name(),
                        reason = %reason,
                        "Solve failed"
                    );
                }
                report.failures.push(sub.name().to_string());
            }

            if let Some(metrics) = self.metrics {
                metrics.record_solve(sub.is_bundle(), sub.feasible, elapsed);
            }
            report
                .durations
                .push((sub.name().to_string(), Duration::from_secs_f64(elapsed)));
        }

        debug!(
            rank = self.rank,
            iteration,
            solved = report.durations.len(),
            failed = report.failures.len(),
            "Solve pass complete"
        );
        Ok(report)
    }

    fn absorb(sub: &mut Subproblem, scenarios: &mut ScenarioTable, outcome: SolveOutcome) -> Result<()> {
        let mut weighted = 0.0;
        for member in sub.members() {
            let solution = outcome
                .members
                .iter()
                .find(|m| m.scenario == member.scenario)
                .ok_or_else(|| {
                    PhError::state(format!(
                        "solver returned no solution for scenario {} of {}",
                        member.scenario,
                        sub.name()
                    ))
                })?;
            let state = scenarios.at_mut(member.key);
            state.set_values(&solution.values)?;
            state.objective = Some(solution.objective);
            state.feasible = true;
            weighted += member.objective_weight * solution.objective;
        }
        sub.bound = Some(outcome.objective_bound.unwrap_or(weighted));
        sub.feasible = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundlingManager;
    use crate::scenario::ScenarioState;
    use crate::tree::ScenarioTree;

    /// Returns the target unless the scenario is named in `fail`
    struct TargetSolver {
        fail: Option<&'static str>,
        persistent: bool,
        synced: usize,
    }

    impl SubproblemSolver<f64> for TargetSolver {
        fn solve(&mut self, request: &SolveRequest<'_, f64>, _options: &SolverOptions) -> Result<SolveOutcome> {
            if let Some(bad) = self.fail {
                if request.members.iter().any(|m| m.scenario == bad) {
                    return Ok(SolveOutcome::failed(SolveStatus::Infeasible, "no point"));
                }
            }
            let members = request
                .members
                .iter()
                .map(|m| MemberSolution {
                    scenario: m.scenario.to_string(),
                    values: vec![*m.model],
                    objective: *m.model * 10.0,
                })
                .collect();
            Ok(SolveOutcome::optimal(members))
        }

        fn is_persistent(&self) -> bool {
            self.persistent
        }

        fn sync_objective(&mut self, _request: &SolveRequest<'_, f64>) -> Result<()> {
            self.synced += 1;
            Ok(())
        }

        fn name(&self) -> &str {
            "target"
        }
    }

    fn setup(bundle: bool) -> (ScenarioTable, Vec<f64>, Vec<Subproblem>) {
        let tree = ScenarioTree::two_stage(vec!["x".into()], ["a", "b", "c"]).unwrap();
        let mut table = ScenarioTable::new();
        for name in ["a", "b", "c"] {
            table.insert(ScenarioState::new(&tree, name, 1.0 / 3.0, 1.0).unwrap()).unwrap();
        }
        let manager = BundlingManager::new();
        let subs = if bundle {
            let names = vec!["a".to_string(), "b".to_string()];
            vec![
                manager.form_bundle(&table, &names, "rank0bundle0").unwrap(),
                manager.single(&table, "c").unwrap(),
            ]
        } else {
            manager.subproblems(&table, &[]).unwrap()
        };
        (table, vec![2.0, 5.0, 8.0], subs)
    }

    fn solvers(n: usize, fail: Option<&'static str>) -> Vec<BoxedSolver<f64>> {
        (0..n)
            .map(|_| {
                Box::new(TargetSolver {
                    fail,
                    persistent: true,
                    synced: 0,
                }) as BoxedSolver<f64>
            })
            .collect()
    }

    #[test]
    fn test_request_respects_overrides() {
        let (mut table, models, subs) = setup(false);
        table.set_terms(true, true);
        let request = build_request(&subs[0], &table, &models, 3, false, TermOverride::prox_only()).unwrap();
        assert_eq!(request.members.len(), 1);
        assert!(request.members[0].w_enabled);
        assert!(!request.members[0].prox_enabled);
        assert_eq!(request.iteration, 3);
    }

    #[test]
    fn test_solve_pulls_values_and_bounds() {
        let (mut table, models, mut subs) = setup(false);
        let mut handles = solvers(3, None);
        let report = SolveLoop::new(0)
            .run(&mut subs, &mut handles, &mut table, &models, &SolverOptions::new(), 0, TermOverride::both(), true)
            .unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.durations.len(), 3);
        assert_eq!(table.get("b").unwrap().slots[0].value, 5.0);
        assert_eq!(table.get("c").unwrap().objective, Some(80.0));
        assert_eq!(subs[0].bound, Some(20.0));
        assert!(table.iter().all(|s| s.feasible));
    }

    #[test]
    fn test_bundle_failure_marks_every_member() {
        let (mut table, models, mut subs) = setup(true);
        let mut handles = solvers(2, Some("b"));
        let report = SolveLoop::new(0)
            .run(&mut subs, &mut handles, &mut table, &models, &SolverOptions::new(), 1, TermOverride::none(), false)
            .unwrap();
        assert_eq!(report.failures, vec!["rank0bundle0".to_string()]);
        assert!(!subs[0].feasible);
        assert!(!table.get("a").unwrap().feasible);
        assert!(!table.get("b").unwrap().feasible);
        assert!(table.get("c").unwrap().feasible);
    }

    #[test]
    fn test_bundle_bound_is_weighted() {
        let (mut table, models, mut subs) = setup(true);
        let mut handles = solvers(2, None);
        SolveLoop::new(0)
            .run(&mut subs, &mut handles, &mut table, &models, &SolverOptions::new(), 0, TermOverride::both(), false)
            .unwrap();
        // members weighted 1/2 each: (20 + 50) / 2
        assert!((subs[0].bound.unwrap() - 35.0).abs() < 1e-12);
    }

    struct Broken {
        on: &'static str,
        in_sync: bool,
    }

    impl SubproblemSolver<f64> for Broken {
        fn solve(&mut self, request: &SolveRequest<'_, f64>, _o: &SolverOptions) -> Result<SolveOutcome> {
            if !self.in_sync && request.members.iter().any(|m| m.scenario == self.on) {
                return Err(PhError::internal("solver process crashed"));
            }
            Ok(SolveOutcome::optimal(
                request
                    .members
                    .iter()
                    .map(|m| MemberSolution {
                        scenario: m.scenario.to_string(),
                        values: vec![*m.model],
                        objective: 0.0,
                    })
                    .collect(),
            ))
        }
        fn is_persistent(&self) -> bool {
            self.in_sync
        }
        fn sync_objective(&mut self, request: &SolveRequest<'_, f64>) -> Result<()> {
            if request.members.iter().any(|m| m.scenario == self.on) {
                return Err(PhError::internal("objective push rejected"));
            }
            Ok(())
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn test_solver_error_marks_subproblem_infeasible() {
        let (mut table, models, mut subs) = setup(false);
        let mut handles: Vec<BoxedSolver<f64>> = (0..3)
            .map(|_| Box::new(Broken { on: "b", in_sync: false }) as BoxedSolver<f64>)
            .collect();
        let report = SolveLoop::new(0)
            .run(&mut subs, &mut handles, &mut table, &models, &SolverOptions::new(), 2, TermOverride::both(), true)
            .unwrap();
        assert_eq!(report.failures, vec!["b".to_string()]);
        assert_eq!(report.durations.len(), 3);
        assert!(!subs[1].feasible);
        assert!(!table.get("b").unwrap().feasible);
        assert!(table.get("a").unwrap().feasible);
        assert_eq!(table.get("c").unwrap().slots[0].value, 8.0);
    }

    #[test]
    fn test_sync_error_marks_subproblem_infeasible() {
        let (mut table, models, mut subs) = setup(false);
        let mut handles: Vec<BoxedSolver<f64>> = (0..3)
            .map(|_| Box::new(Broken { on: "a", in_sync: true }) as BoxedSolver<f64>)
            .collect();
        let report = SolveLoop::new(0)
            .run(&mut subs, &mut handles, &mut table, &models, &SolverOptions::new(), 1, TermOverride::both(), false)
            .unwrap();
        assert_eq!(report.failures, vec!["a".to_string()]);
        assert!(!table.get("a").unwrap().feasible);
        assert!(table.get("b").unwrap().feasible);
    }
}
