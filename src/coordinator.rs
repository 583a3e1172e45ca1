//! Progressive Hedging coordinator
//!
//! Drives one worker through `Setup → Iter0 → IterK → Finalize`. Every
//! worker of the process group runs its own coordinator over its own
//! partition of scenarios; workers meet only in collectives.
//!
//! ## Table of Contents
//! - **Phase / IterationState**: Where the run is
//! - **PhOutcome**: Result of a full run
//! - **PhCoordinatorBuilder**: Collaborator wiring and setup
//! - **PhCoordinator**: Iteration driver and ensemble queries

use crate::bundle::{BundlingManager, Subproblem};
use crate::cache::VariableStateCache;
use crate::comm::{all_reduce_scalar, BoxedProcessGroup, Communicator, ProcessGroup, ReduceOp};
use crate::config::PhConfig;
use crate::consensus::{ConsensusAggregator, WeightUpdater};
use crate::convergence::{BoxedConverger, BoxedHubCoordinator, ConvergenceMonitor};
use crate::error::{PhError, Result};
use crate::hooks::{BoxedExtension, IterationContext, RhoSetter, ScenarioCreator, ScenarioDenouement};
use crate::metrics::{PhMetrics, Timer};
use crate::registry::SubproblemRegistry;
use crate::scenario::{ScenarioState, ScenarioTable};
use crate::solve::{build_request, BoxedSolver, SolveLoop, SolveReport, SolverFactory, TermOverride};
use crate::synchronizer::AsyncSynchronizer;
use crate::tree::ScenarioTree;
use crate::types::{RunId, SolverOptions, Termination};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lifecycle phase of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Scenarios, bundles and communicators are built
    Setup,
    /// Iteration zero running
    Iter0,
    /// Steady-state iterations
    IterK,
    /// Finalize done
    Finalized,
}

/// Iteration counter and latest convergence value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationState {
    /// Current phase
    pub phase: Phase,
    /// Current iteration (0 during iteration zero)
    pub iteration: usize,
    /// Latest convergence value, if one was measured
    pub conv: Option<f64>,
}

/// Result of [`PhCoordinator::ph_main`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhOutcome {
    /// Last convergence value
    pub convergence: Option<f64>,
    /// Probability-weighted objective over the ensemble
    pub expected_objective: f64,
    /// Expected bound after iteration zero
    pub trivial_bound: f64,
    /// Iterations started after iteration zero
    pub iterations: usize,
    /// Why the loop stopped
    pub termination: Termination,
}

/// Wires collaborators and runs setup
pub struct PhCoordinatorBuilder<M> {
    config: Arc<PhConfig>,
    group: BoxedProcessGroup,
    tree: Arc<ScenarioTree>,
    creator: Arc<dyn ScenarioCreator<M>>,
    factory: Arc<dyn SolverFactory<M>>,
    creator_kwargs: serde_json::Value,
    denouement: Option<Box<dyn ScenarioDenouement<M>>>,
    extension: Option<BoxedExtension>,
    converger: Option<BoxedConverger>,
    hub: Option<BoxedHubCoordinator>,
    rho_setter: Option<Box<dyn RhoSetter<M>>>,
    metrics_enabled: bool,
}

impl<M: Send + Sync + 'static> PhCoordinatorBuilder<M> {
    /// Arguments passed unchanged to the scenario creator
    pub fn creator_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.creator_kwargs = kwargs;
        self
    }

    /// Per-scenario reporting at finalize
    pub fn denouement(mut self, denouement: impl ScenarioDenouement<M> + 'static) -> Self {
        self.denouement = Some(Box::new(denouement));
        self
    }

    /// Iteration hooks
    pub fn extension(mut self, extension: BoxedExtension) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Replace the built-in convergence metric
    pub fn converger(mut self, converger: BoxedConverger) -> Self {
        self.converger = Some(converger);
        self
    }

    /// Attach a hub coordinator
    pub fn hub(mut self, hub: BoxedHubCoordinator) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Per-variable rho applied once after iteration zero
    pub fn rho_setter(mut self, setter: impl RhoSetter<M> + 'static) -> Self {
        self.rho_setter = Some(Box::new(setter));
        self
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Build local scenarios, bundles and communicators.
    ///
    /// A failure aborts the group so peers do not wait on this worker.
    pub async fn setup(self) -> Result<PhCoordinator<M>> {
        let group = self.group.clone();
        let built = self.assemble().await;
        if let Err(e) = &built {
            abort_group(group.as_ref(), "setup", e);
        }
        built
    }

    async fn assemble(self) -> Result<PhCoordinator<M>> {
        let config = self.config;
        config.validate()?;
        let default_rho = match (config.default_rho, self.rho_setter.is_some()) {
            (Some(rho), _) => rho,
            (None, true) => 0.0,
            (None, false) => {
                return Err(PhError::config("no default_rho and no rho setter supplied"));
            }
        };

        let group = self.group;
        let rank = group.rank();
        let tree = self.tree;
        let registry = SubproblemRegistry::new(&tree, group.size(), config.bundles_per_rank)?;

        let mut scenarios = ScenarioTable::new();
        let mut models = Vec::new();
        for name in registry.local_scenarios(rank) {
            let created = self.creator.create(name, &self.creator_kwargs)?;
            created.verify_layout(&tree, name)?;
            let mut state = ScenarioState::new(&tree, name.as_str(), created.probability, default_rho)?;
            for (node, values) in &created.initial_values {
                state.set_node_values(node, values)?;
            }
            scenarios.insert(state)?;
            models.push(created.model);
        }

        let subproblems = BundlingManager::new().subproblems(&scenarios, registry.bundles(rank))?;
        let aggregator = ConsensusAggregator::new(registry.communicators_for(&tree, rank)?);

        let metrics = if self.metrics_enabled {
            Some(Arc::new(PhMetrics::new()?))
        } else {
            None
        };
        let synchronizer = match config.async_settings() {
            Some(settings) => {
                let sync = AsyncSynchronizer::establish(group.as_ref(), settings).await?;
                Some(match &metrics {
                    Some(m) => sync.with_metrics(m.clone()),
                    None => sync,
                })
            }
            None => None,
        };
        let monitor = ConvergenceMonitor::new(config.convergence_threshold)
            .with_converger(self.converger)
            .with_hub(self.hub);

        let run_id = RunId::new();
        if rank == 0 {
            info!(
                run = %run_id,
                group = %group.name(),
                workers = group.size(),
                scenarios = tree.scenario_count(),
                bundling = registry.bundling(),
                asynchronous = synchronizer.is_some(),
                "PH setup complete"
            );
        }
        debug!(rank, local = scenarios.len(), subproblems = subproblems.len(), "Local partition");

        Ok(PhCoordinator {
            cache: VariableStateCache::new(config.persistent_refresh),
            config,
            run_id,
            group,
            tree,
            registry,
            scenarios,
            models,
            subproblems,
            solvers: Vec::new(),
            factory: self.factory,
            denouement: self.denouement,
            extension: self.extension,
            rho_setter: self.rho_setter,
            aggregator,
            updater: WeightUpdater::new(),
            monitor,
            synchronizer,
            metrics,
            state: IterationState {
                phase: Phase::Setup,
                iteration: 0,
                conv: None,
            },
            e1: 0.0,
            trivial_bound: None,
            timer: Timer::start(),
        })
    }
}

fn abort_group(group: &dyn ProcessGroup, during: &str, error: &PhError) {
    if !group.abort_signal().is_cancelled() {
        error!(rank = group.rank(), during, error = %error, "Aborting process group");
    }
    group.abort_signal().cancel();
    group.quit_signal().cancel();
}

/// One worker's PH driver
pub struct PhCoordinator<M> {
    config: Arc<PhConfig>,
    run_id: RunId,
    group: BoxedProcessGroup,
    tree: Arc<ScenarioTree>,
    registry: SubproblemRegistry,
    scenarios: ScenarioTable,
    models: Vec<M>,
    subproblems: Vec<Subproblem>,
    solvers: Vec<BoxedSolver<M>>,
    factory: Arc<dyn SolverFactory<M>>,
    denouement: Option<Box<dyn ScenarioDenouement<M>>>,
    extension: Option<BoxedExtension>,
    rho_setter: Option<Box<dyn RhoSetter<M>>>,
    aggregator: ConsensusAggregator,
    updater: WeightUpdater,
    cache: VariableStateCache,
    monitor: ConvergenceMonitor,
    synchronizer: Option<AsyncSynchronizer>,
    metrics: Option<Arc<PhMetrics>>,
    state: IterationState,
    e1: f64,
    trivial_bound: Option<f64>,
    timer: Timer,
}

impl<M: Send + Sync + 'static> PhCoordinator<M> {
    /// Start wiring a coordinator
    pub fn builder(
        config: Arc<PhConfig>,
        group: BoxedProcessGroup,
        tree: Arc<ScenarioTree>,
        creator: Arc<dyn ScenarioCreator<M>>,
        factory: Arc<dyn SolverFactory<M>>,
    ) -> PhCoordinatorBuilder<M> {
        PhCoordinatorBuilder {
            config,
            group,
            tree,
            creator,
            factory,
            creator_kwargs: serde_json::Value::Null,
            denouement: None,
            extension: None,
            converger: None,
            hub: None,
            rho_setter: None,
            metrics_enabled: false,
        }
    }

    /// Run identifier
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// This worker's rank
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// Configuration in use
    pub fn config(&self) -> &PhConfig {
        &self.config
    }

    /// Scenario tree
    pub fn tree(&self) -> &ScenarioTree {
        &self.tree
    }

    /// Scenario partition and bundle layout
    pub fn registry(&self) -> &SubproblemRegistry {
        &self.registry
    }

    /// Worker-local scenarios
    pub fn scenarios(&self) -> &ScenarioTable {
        &self.scenarios
    }

    /// Worker-local models, aligned with [`Self::scenarios`]
    pub fn models(&self) -> &[M] {
        &self.models
    }

    /// Worker-local subproblems
    pub fn subproblems(&self) -> &[Subproblem] {
        &self.subproblems
    }

    /// Iteration counter and latest convergence value
    pub fn iteration_state(&self) -> &IterationState {
        &self.state
    }

    /// Total probability from the last `update_e1`
    pub fn e1(&self) -> f64 {
        self.e1
    }

    /// Expected bound after iteration zero
    pub fn trivial_bound(&self) -> Option<f64> {
        self.trivial_bound
    }

    /// Metrics, when enabled
    pub fn metrics(&self) -> Option<&Arc<PhMetrics>> {
        self.metrics.as_ref()
    }

    /// Solver options of the current phase
    pub fn active_solver_options(&self) -> &SolverOptions {
        match self.state.phase {
            Phase::Setup | Phase::Iter0 => &self.config.iter0_solver_options,
            Phase::IterK | Phase::Finalized => &self.config.iterk_solver_options,
        }
    }

    fn progress(&self) -> bool {
        self.config.display_progress && self.rank() == 0
    }

    fn expect_phase(&self, expected: Phase, operation: &str) -> Result<()> {
        if self.state.phase != expected {
            return Err(PhError::state(format!(
                "{} called in phase {:?}, expected {:?}",
                operation, self.state.phase, expected
            )));
        }
        Ok(())
    }

    /// Iteration zero, the iteration loop and finalize.
    ///
    /// Any error aborts the whole group: collectives pending on other
    /// workers fail instead of waiting for this one.
    pub async fn ph_main(&mut self) -> Result<PhOutcome> {
        let outcome = self.run_phases().await;
        if let Err(e) = &outcome {
            abort_group(self.group.as_ref(), "ph_main", e);
        }
        outcome
    }

    async fn run_phases(&mut self) -> Result<PhOutcome> {
        let trivial_bound = self.iter0().await?;
        let termination = self.iterk_loop().await?;
        let expected_objective = self.finalize().await?;
        Ok(PhOutcome {
            convergence: self.state.conv,
            expected_objective,
            trivial_bound,
            iterations: self.state.iteration,
            termination,
        })
    }

    /// Iteration zero: solve without W and prox, check probabilities and
    /// feasibility, apply the rho setter, compute the trivial bound.
    pub async fn iter0(&mut self) -> Result<f64> {
        self.expect_phase(Phase::Setup, "iter0")?;
        self.state.phase = Phase::Iter0;
        self.state.iteration = 0;
        let rank = self.rank();

        if let Some(ext) = self.extension.as_mut() {
            let ctx = IterationContext {
                iteration: 0,
                scenarios: &self.scenarios,
                group: self.group.as_ref(),
            };
            ext.pre_iter0(&ctx)?;
        }

        let e1 = self.update_e1().await?;
        if (e1 - 1.0).abs() > self.config.probability_tolerance {
            if rank == 0 {
                error!(e1, tolerance = self.config.probability_tolerance, "Total scenario probability is not one");
            }
            return Err(PhError::probability(format!(
                "total probability {} differs from 1 by more than {}",
                e1, self.config.probability_tolerance
            )));
        }

        self.create_solvers()?;
        self.cache.save_original(&mut self.scenarios)?;

        let options = self.config.iter0_solver_options.clone();
        let report = self.solve_pass(&options, TermOverride::none())?;
        if self.config.display_timing {
            self.report_timing(&report).await?;
        }

        let feasible = self.feas_prob().await?;
        if (feasible - e1).abs() > self.config.probability_tolerance {
            if rank == 0 {
                error!(feasible, e1, "Infeasibility detected after iteration 0");
            }
            return Err(PhError::infeasibility(format!(
                "feasible probability {} does not match total probability {}",
                feasible, e1
            )));
        }

        if let Some(ext) = self.extension.as_mut() {
            let ctx = IterationContext {
                iteration: 0,
                scenarios: &self.scenarios,
                group: self.group.as_ref(),
            };
            ext.post_iter0(&ctx)?;
        }

        self.apply_rho_setter();

        let trivial_bound = self.ebound().await?;
        self.trivial_bound = Some(trivial_bound);
        if self.progress() {
            info!(
                iteration = 0,
                trivial_bound,
                elapsed_secs = self.timer.elapsed_secs(),
                "After PH iteration"
            );
        }

        self.scenarios.set_terms(true, true);
        self.state.phase = Phase::IterK;
        Ok(trivial_bound)
    }

    /// Steady-state iterations until convergence, the iteration limit or cancellation
    pub async fn iterk_loop(&mut self) -> Result<Termination> {
        self.expect_phase(Phase::IterK, "iterk_loop")?;
        let rank = self.rank();
        let verbose = self.config.verbose;
        let asynchronous = self.synchronizer.is_some();
        let options = self.config.iterk_solver_options.clone();
        let mut termination = Termination::IterationLimit;

        for iteration in 1..=self.config.iteration_limit {
            if self
                .synchronizer
                .as_ref()
                .map(|s| s.cancel_signal().is_cancelled())
                .unwrap_or(false)
            {
                info!(rank, iteration, "Stopping on quit signal");
                termination = Termination::Cancelled;
                break;
            }

            self.state.iteration = iteration;
            let iteration_timer = Timer::start();
            if self.progress() {
                info!(iteration, "Initiating PH iteration");
            }

            self.aggregator
                .compute_xbar(self.group.as_ref(), &mut self.scenarios, self.synchronizer.as_ref(), verbose)
                .await?;
            self.updater.update(&mut self.scenarios, rank, verbose);

            let decision = {
                let ctx = IterationContext {
                    iteration,
                    scenarios: &self.scenarios,
                    group: self.group.as_ref(),
                };
                let metric = self.monitor.measure(&ctx, asynchronous).await?;
                self.state.conv = metric;
                if let Some(ext) = self.extension.as_mut() {
                    ext.mid_iteration(&ctx)?;
                }
                self.monitor.decide(&ctx, metric).await?
            };
            if let Some(stop) = decision {
                termination = stop;
                break;
            }

            let report = self.solve_pass(&options, TermOverride::none())?;
            if self.config.display_timing {
                self.report_timing(&report).await?;
            }

            if let Some(ext) = self.extension.as_mut() {
                let ctx = IterationContext {
                    iteration,
                    scenarios: &self.scenarios,
                    group: self.group.as_ref(),
                };
                ext.end_iteration(&ctx)?;
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_iteration(self.state.conv.unwrap_or(f64::NAN));
            }
            if self.progress() {
                info!(
                    iteration,
                    conv = ?self.state.conv,
                    iteration_secs = iteration_timer.elapsed_secs(),
                    elapsed_secs = self.timer.elapsed_secs(),
                    "After PH iteration"
                );
            }
        }

        if let Some(sync) = &self.synchronizer {
            debug!(rank, "Raising quit signal");
            sync.signal_quit();
        }
        Ok(termination)
    }

    /// Denouement, final extension hook, expected objective
    pub async fn finalize(&mut self) -> Result<f64> {
        self.expect_phase(Phase::IterK, "finalize")?;
        let rank = self.rank();

        self.group.barrier().await?;
        if self.progress() {
            info!("Invoking scenario reporting functions");
        }
        if let Some(denouement) = &self.denouement {
            for (s, model) in self.scenarios.iter().zip(&self.models) {
                denouement.denouement(rank, &s.name, model);
            }
        }

        self.group.barrier().await?;
        if let Some(ext) = self.extension.as_mut() {
            let ctx = IterationContext {
                iteration: self.state.iteration,
                scenarios: &self.scenarios,
                group: self.group.as_ref(),
            };
            ext.post_everything(&ctx)?;
        }

        let eobj = self.eobjective().await?;
        self.group.barrier().await?;

        if self.progress() {
            info!(expected_objective = eobj, "Weighted E[objective]");
        }
        if self.config.display_timing && rank == 0 {
            info!(run = %self.run_id, cumulative_secs = self.timer.elapsed_secs(), "Cumulative execution time");
        }
        self.state.phase = Phase::Finalized;
        Ok(eobj)
    }

    fn create_solvers(&mut self) -> Result<()> {
        if self.rank() == 0 {
            debug!(solver = %self.config.solver_name, "Creating solvers");
        }
        self.solvers = self
            .subproblems
            .iter()
            .map(|sub| self.factory.create(&self.config.solver_name, sub))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn solve_pass(&mut self, options: &SolverOptions, terms: TermOverride) -> Result<SolveReport> {
        SolveLoop::new(self.group.rank())
            .tee_rank0(self.config.tee_rank0_solves)
            .with_metrics(self.metrics.as_ref())
            .run(
                &mut self.subproblems,
                &mut self.solvers,
                &mut self.scenarios,
                &self.models,
                options,
                self.state.iteration,
                terms,
                true,
            )
    }

    async fn report_timing(&self, report: &SolveReport) -> Result<()> {
        let local = report.total().as_secs_f64();
        if self.synchronizer.is_some() {
            info!(rank = self.rank(), iteration = self.state.iteration, solve_secs = local, "Solve time");
            return Ok(());
        }
        let gathered = self.group.gather(0, serde_json::json!(local)).await?;
        if let Some(all) = gathered {
            let times: Vec<f64> = all.iter().filter_map(|v| v.as_f64()).collect();
            let min = times.iter().copied().fold(f64::INFINITY, f64::min);
            let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mean = times.iter().sum::<f64>() / times.len().max(1) as f64;
            info!(iteration = self.state.iteration, min, mean, max, "Solve times (secs)");
        }
        Ok(())
    }

    fn apply_rho_setter(&mut self) {
        let Some(setter) = self.rho_setter.as_ref() else {
            return;
        };
        let mut set = 0usize;
        let mut skipped = 0usize;
        for (s, model) in self.scenarios.iter_mut().zip(&self.models) {
            for (name, rho) in setter.rho_pairs(&s.name, model, &self.config.rho_setter_kwargs) {
                match s.position_of_name(&name) {
                    Some(p) => {
                        s.slots[p].rho = rho;
                        set += 1;
                    }
                    None => skipped += 1,
                }
            }
        }
        if self.config.verbose && self.rank() == 0 {
            info!(set, skipped, "Rho setter applied");
        }
    }

    /// Sum-reduce the scenario probabilities over the group
    pub async fn update_e1(&mut self) -> Result<f64> {
        let local = self.scenarios.probability();
        self.e1 = all_reduce_scalar(self.group.as_ref(), ReduceOp::Sum, local).await?;
        Ok(self.e1)
    }

    /// Probability mass of scenarios whose last solve succeeded
    pub async fn feas_prob(&self) -> Result<f64> {
        let local: f64 = self
            .scenarios
            .iter()
            .filter(|s| s.feasible)
            .map(|s| s.probability)
            .sum();
        all_reduce_scalar(self.group.as_ref(), ReduceOp::Sum, local).await
    }

    /// Probability-weighted objective over the ensemble
    pub async fn eobjective(&self) -> Result<f64> {
        let local: f64 = self
            .scenarios
            .iter()
            .map(|s| s.probability * s.objective.unwrap_or(0.0))
            .sum();
        all_reduce_scalar(self.group.as_ref(), ReduceOp::Sum, local).await
    }

    /// Probability-weighted subproblem bound over the ensemble
    pub async fn ebound(&self) -> Result<f64> {
        let local: f64 = self
            .subproblems
            .iter()
            .filter_map(|sub| sub.bound.map(|b| sub.probability() * b))
            .sum();
        all_reduce_scalar(self.group.as_ref(), ReduceOp::Sum, local).await
    }

    /// Probability-weighted sum, minimum and maximum of a per-scenario value
    pub async fn avg_min_max<F>(&self, extract: F) -> Result<(f64, f64, f64)>
    where
        F: Fn(&ScenarioState) -> f64 + Send,
    {
        let mut avg = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for s in self.scenarios.iter() {
            let v = extract(s);
            avg += s.probability * v;
            min = min.min(v);
            max = max.max(v);
        }
        let world = Communicator::world(self.group.size());
        let group = self.group.as_ref();
        let avg = group.all_reduce(&world, ReduceOp::Sum, &[avg]).await?;
        let min = group.all_reduce(&world, ReduceOp::Min, &[min]).await?;
        let max = group.all_reduce(&world, ReduceOp::Max, &[max]).await?;
        Ok((avg[0], min[0], max[0]))
    }

    /// Every local W in slot order across local scenarios
    pub fn populate_w_cache(&self) -> Vec<f64> {
        self.scenarios
            .iter()
            .flat_map(|s| s.slots.iter().map(|slot| slot.w))
            .collect()
    }

    /// Set every local W from a flat list and refresh persistent objectives
    pub fn w_from_flat_list(&mut self, flat: &[f64]) -> Result<()> {
        let needed: usize = self.scenarios.iter().map(|s| s.slots.len()).sum();
        if flat.len() != needed {
            return Err(PhError::state(format!(
                "W list has {} entries, local slots need {}",
                flat.len(),
                needed
            )));
        }
        let mut values = flat.iter();
        for s in self.scenarios.iter_mut() {
            for (slot, &w) in s.slots.iter_mut().zip(&mut values) {
                slot.w = w;
            }
        }
        let tee = self.config.tee_rank0_solves && self.rank() == 0;
        for (sub, solver) in self.subproblems.iter().zip(self.solvers.iter_mut()) {
            if solver.is_persistent() {
                let request = build_request(sub, &self.scenarios, &self.models, self.state.iteration, tee, TermOverride::none())?;
                solver.sync_objective(&request)?;
            }
        }
        Ok(())
    }

    /// Snapshot current values and fixed status
    pub fn save_nonants(&mut self) {
        self.cache.save(&mut self.scenarios);
    }

    /// Restore the last snapshot
    pub fn restore_nonants(&mut self) -> Result<()> {
        self.cache
            .restore(&mut self.scenarios, &self.subproblems, &mut self.solvers)
    }

    /// Fix slots at the supplied per-node values (after `save_nonants`)
    pub fn fix_nonants(&mut self, values_by_node: &HashMap<String, Vec<f64>>) -> Result<()> {
        self.cache
            .fix(&mut self.scenarios, values_by_node, &self.subproblems, &mut self.solvers)
    }

    /// Restore the state captured before the iteration-zero solves
    pub fn restore_original_nonants(&mut self) -> Result<()> {
        let bundling = self.registry.bundling();
        self.cache
            .restore_original(&mut self.scenarios, bundling, &self.subproblems, &mut self.solvers)
    }

    /// Overwrite the save caches from a flat list in local slot order
    pub fn put_nonant_cache(&mut self, flat: &[f64]) -> Result<()> {
        self.cache.put_nonant_cache(&mut self.scenarios, flat)
    }

    /// Lagrangian bound from the current W: prox off, original fixedness,
    /// one solve pass, expected bound. Leaves the solved values in place.
    pub async fn post_solve_bound(&mut self) -> Result<f64> {
        self.scenarios.set_w_enabled(true);
        self.scenarios.set_prox_enabled(false);
        self.cache
            .restore_original_fixedness(&mut self.scenarios, &self.subproblems, &mut self.solvers)?;
        let options = self.config.iterk_solver_options.clone();
        self.solve_pass(&options, TermOverride::prox_only())?;
        let bound = self.ebound().await?;
        self.scenarios.set_prox_enabled(true);
        if self.rank() == 0 {
            debug!(bound, "Post-solve bound");
        }
        Ok(bound)
    }

    /// Gather `(scenario, variable) -> value` on rank 0; `None` elsewhere
    pub async fn gather_var_values_to_root(&self) -> Result<Option<BTreeMap<(String, String), f64>>> {
        let local: Vec<(String, String, f64)> = self
            .scenarios
            .iter()
            .flat_map(|s| {
                s.slots
                    .iter()
                    .map(move |slot| (s.name.clone(), slot.name.clone(), slot.value))
            })
            .collect();
        let gathered = self.group.gather(0, serde_json::to_value(local)?).await?;
        match gathered {
            None => Ok(None),
            Some(parts) => {
                let mut values = BTreeMap::new();
                for part in parts {
                    let entries: Vec<(String, String, f64)> = serde_json::from_value(part)?;
                    for (scenario, var, value) in entries {
                        values.insert((scenario, var), value);
                    }
                }
                Ok(Some(values))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalProcessGroup;
    use crate::hooks::CreatedScenario;
    use crate::solve::{MemberSolution, SolveOutcome, SolveRequest, SubproblemSolver};
    use crate::types::VariableIndex;

    /// Minimises `(x − t)² + w·x + rho/2 (x − xbar)²` over [0, 10]
    struct Quadratic;

    impl SubproblemSolver<f64> for Quadratic {
        fn solve(&mut self, request: &SolveRequest<'_, f64>, _o: &SolverOptions) -> Result<SolveOutcome> {
            let members = request
                .members
                .iter()
                .map(|m| {
                    let t = *m.model;
                    let slot = &m.slots[0];
                    let w = if m.w_enabled { slot.w } else { 0.0 };
                    let (num, den) = if m.prox_enabled {
                        (2.0 * t - w + slot.rho * slot.xbar, 2.0 + slot.rho)
                    } else {
                        (2.0 * t - w, 2.0)
                    };
                    let x = if slot.fixed { slot.value } else { (num / den).clamp(0.0, 10.0) };
                    MemberSolution {
                        scenario: m.scenario.to_string(),
                        values: vec![x],
                        objective: (x - t).powi(2),
                    }
                })
                .collect();
            Ok(SolveOutcome::optimal(members))
        }

        fn name(&self) -> &str {
            "quadratic"
        }
    }

    fn base() -> crate::config::PhConfigBuilder {
        PhConfig::builder()
            .solver_name("quadratic")
            .iteration_limit(200)
            .convergence_threshold(1e-7)
            .verbose(false)
            .display_progress(false)
            .display_timing(false)
            .iter0_solver_options(SolverOptions::new())
            .iterk_solver_options(SolverOptions::new())
    }

    fn config() -> Arc<PhConfig> {
        Arc::new(base().default_rho(1.0).build().unwrap())
    }

    fn tree(n: usize) -> Arc<ScenarioTree> {
        let names: Vec<String> = (0..n).map(|i| format!("scen{}", i)).collect();
        Arc::new(ScenarioTree::two_stage(vec!["x".into()], names).unwrap())
    }

    fn creator(prob: f64) -> Arc<dyn ScenarioCreator<f64>> {
        Arc::new(move |name: &str, _kw: &serde_json::Value| -> Result<CreatedScenario<f64>> {
            let i: f64 = name.trim_start_matches("scen").parse().unwrap_or(0.0);
            Ok(CreatedScenario::new(prob, 2.0 + 3.0 * i))
        })
    }

    fn factory() -> Arc<dyn SolverFactory<f64>> {
        Arc::new(|_name: &str, _sub: &Subproblem| -> Result<BoxedSolver<f64>> { Ok(Box::new(Quadratic)) })
    }

    async fn coordinator(prob: f64) -> PhCoordinator<f64> {
        PhCoordinator::builder(
            config(),
            Arc::new(LocalProcessGroup::single()),
            tree(3),
            creator(prob),
            factory(),
        )
        .with_metrics(true)
        .setup()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_setup_builds_local_state() {
        let ph = coordinator(1.0 / 3.0).await;
        assert_eq!(ph.scenarios().len(), 3);
        assert_eq!(ph.subproblems().len(), 3);
        assert_eq!(ph.models(), &[2.0, 5.0, 8.0]);
        assert_eq!(ph.iteration_state().phase, Phase::Setup);
        assert!(ph.scenarios().iter().all(|s| !s.w_enabled && !s.prox_enabled));
    }

    #[tokio::test]
    async fn test_missing_rho_source_is_config_error() {
        let config = Arc::new(base().without_default_rho().build().unwrap());
        let result = PhCoordinator::builder(config, Arc::new(LocalProcessGroup::single()), tree(3), creator(1.0 / 3.0), factory())
            .setup()
            .await;
        assert!(matches!(result, Err(PhError::Config(_))));
    }

    #[tokio::test]
    async fn test_bad_probability_fails_before_solving() {
        let mut ph = coordinator(0.25).await;
        let err = ph.iter0().await.unwrap_err();
        assert!(matches!(err, PhError::Probability(_)));
        assert!(ph.scenarios().iter().all(|s| s.objective.is_none()));
    }

    #[tokio::test]
    async fn test_iter0_solves_without_terms() {
        let mut ph = coordinator(1.0 / 3.0).await;
        let bound = ph.iter0().await.unwrap();
        assert_eq!(ph.scenarios().at(2).values(), vec![8.0]);
        assert_eq!(bound, 0.0);
        assert!((ph.e1() - 1.0).abs() < 1e-12);
        assert!(ph.scenarios().iter().all(|s| s.w_enabled && s.prox_enabled));
        assert_eq!(ph.active_solver_options(), &ph.config().iterk_solver_options);
        assert!(ph.iter0().await.is_err());
    }

    #[tokio::test]
    async fn test_full_run_converges() {
        let mut ph = coordinator(1.0 / 3.0).await;
        let outcome = ph.ph_main().await.unwrap();
        assert_eq!(outcome.termination, Termination::Converged);
        assert!(outcome.convergence.unwrap() < 1e-7);
        for s in ph.scenarios().iter() {
            assert!((s.values()[0] - 5.0).abs() < 1e-5);
        }
        let expected: f64 = ph
            .scenarios()
            .iter()
            .map(|s| s.probability * s.objective.unwrap())
            .sum();
        assert!((outcome.expected_objective - expected).abs() < 1e-12);
        assert!(ph.metrics().unwrap().gather_text().unwrap().contains("ph_iterations_total"));
    }

    #[tokio::test]
    async fn test_ensemble_queries() {
        let mut ph = coordinator(1.0 / 3.0).await;
        ph.iter0().await.unwrap();

        let (avg, min, max) = ph.avg_min_max(|s| s.values()[0]).await.unwrap();
        assert!((avg - 5.0).abs() < 1e-12);
        assert_eq!((min, max), (2.0, 8.0));

        let gathered = ph.gather_var_values_to_root().await.unwrap().unwrap();
        assert_eq!(gathered[&("scen1".to_string(), "x".to_string())], 5.0);

        assert_eq!(ph.populate_w_cache(), vec![0.0; 3]);
        ph.w_from_flat_list(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(ph.populate_w_cache(), vec![1.0, 2.0, 3.0]);
        assert!(matches!(ph.w_from_flat_list(&[1.0]), Err(PhError::State(_))));
    }

    #[tokio::test]
    async fn test_fix_and_restore_through_coordinator() {
        let mut ph = coordinator(1.0 / 3.0).await;
        ph.iter0().await.unwrap();
        ph.save_nonants();
        ph.fix_nonants(&HashMap::from([("ROOT".to_string(), vec![4.0])])).unwrap();
        let idx = VariableIndex::new("ROOT", 0);
        assert!(ph.scenarios().at(0).slot(&idx).unwrap().fixed);
        ph.restore_nonants().unwrap();
        assert_eq!(ph.scenarios().at(0).values(), vec![2.0]);
        ph.restore_original_nonants().unwrap();
        assert_eq!(ph.scenarios().at(0).values(), vec![0.0]);
    }

    #[tokio::test]
    async fn test_post_solve_bound_uses_weights_only() {
        let mut ph = coordinator(1.0 / 3.0).await;
        ph.iter0().await.unwrap();
        ph.w_from_flat_list(&[-2.0, 0.0, 2.0]).unwrap();
        let bound = ph.post_solve_bound().await.unwrap();
        // x = t − w/2 gives 3, 5, 7; objective (w/2)² = 1, 0, 1
        assert!((bound - 2.0 / 3.0).abs() < 1e-12);
        assert!(ph.scenarios().iter().all(|s| s.prox_enabled));
    }
}
