//! PH configuration
//!
//! ## Table of Contents
//! - **PhConfig**: Immutable run configuration
//! - **PhConfigBuilder**: Builder pattern for PhConfig
//! - **AsyncSettings**: Quorum settings for asynchronous runs
//! - **RefreshGranularity**: How restored slots are pushed to persistent solvers

use crate::error::{PhError, Result};
use crate::types::SolverOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Options that must be present in every option set
pub const REQUIRED_OPTIONS: &[&str] = &[
    "solver_name",
    "iteration_limit",
    "default_rho",
    "convergence_threshold",
    "verbose",
    "display_progress",
    "display_timing",
    "iter0_solver_options",
    "iterk_solver_options",
];

/// Additional options required when `asynchronous` is set
pub const REQUIRED_ASYNC_OPTIONS: &[&str] = &["async_frac_needed", "async_sleep_secs"];

const DEFAULT_PROBABILITY_TOLERANCE: f64 = 1e-5;

fn default_probability_tolerance() -> f64 {
    DEFAULT_PROBABILITY_TOLERANCE
}

/// Granularity used when pushing variable updates to persistent solvers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshGranularity {
    /// One `update_variable` call per slot
    #[default]
    Variable,
    /// One batched `update_variables` call per subproblem
    Subproblem,
}

/// Quorum settings for asynchronous runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsyncSettings {
    /// Fraction of workers whose contribution must be observed
    pub frac_needed: f64,
    /// Sleep between quorum polls
    pub sleep: Duration,
}

/// Complete PH configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhConfig {
    /// Solver name handed to the solver factory
    pub solver_name: String,
    /// Maximum number of PH iterations after iteration zero
    pub iteration_limit: usize,
    /// Default proximal coefficient; `None` requires a rho setter
    pub default_rho: Option<f64>,
    /// Convergence threshold for the built-in metric
    pub convergence_threshold: f64,
    /// Verbose per-slot tracing
    pub verbose: bool,
    /// Per-iteration progress output on rank 0
    pub display_progress: bool,
    /// Timing output on rank 0
    pub display_timing: bool,
    /// Solver options for iteration zero
    pub iter0_solver_options: SolverOptions,
    /// Solver options for iterations one and later
    pub iterk_solver_options: SolverOptions,
    /// Run the quorum-based asynchronous variant
    #[serde(default)]
    pub asynchronous: bool,
    /// Quorum fraction (asynchronous only)
    #[serde(default)]
    pub async_frac_needed: Option<f64>,
    /// Seconds between quorum polls (asynchronous only)
    #[serde(default)]
    pub async_sleep_secs: Option<f64>,
    /// Tolerance on the total probability and feasible probability checks
    #[serde(default = "default_probability_tolerance")]
    pub probability_tolerance: f64,
    /// Bundles per worker (0 disables bundling)
    #[serde(default)]
    pub bundles_per_rank: usize,
    /// Show solver output for rank 0 solves
    #[serde(default)]
    pub tee_rank0_solves: bool,
    /// Persistent-solver refresh granularity
    #[serde(default)]
    pub persistent_refresh: RefreshGranularity,
    /// Keyword arguments handed to the rho setter
    #[serde(default)]
    pub rho_setter_kwargs: serde_json::Value,
}

impl PhConfig {
    /// Start building a configuration
    pub fn builder() -> PhConfigBuilder {
        PhConfigBuilder::new()
    }

    /// Load from a JSON option map, checking required options first
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_json_value(value)
    }

    /// Load from a JSON value holding an option map
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| PhError::config("options must be a JSON object"))?;

        check_required(map, REQUIRED_OPTIONS)?;
        let asynchronous = map
            .get("asynchronous")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if asynchronous {
            check_required(map, REQUIRED_ASYNC_OPTIONS)?;
        }

        let config: PhConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading PH options");
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.solver_name.is_empty() {
            return Err(PhError::config("solver_name cannot be empty"));
        }
        if !(self.probability_tolerance > 0.0) {
            return Err(PhError::config("probability_tolerance must be positive"));
        }
        if let Some(rho) = self.default_rho {
            if !(rho >= 0.0) {
                return Err(PhError::config("default_rho must be non-negative"));
            }
        }
        if self.asynchronous {
            let frac = self
                .async_frac_needed
                .ok_or_else(|| PhError::config("missing required option async_frac_needed"))?;
            let secs = self
                .async_sleep_secs
                .ok_or_else(|| PhError::config("missing required option async_sleep_secs"))?;
            if !(frac > 0.0 && frac <= 1.0) {
                return Err(PhError::config("async_frac_needed must be in (0, 1]"));
            }
            if !(secs > 0.0) {
                return Err(PhError::config("async_sleep_secs must be positive"));
            }
        }
        Ok(())
    }

    /// Quorum settings, present only for asynchronous runs
    pub fn async_settings(&self) -> Option<AsyncSettings> {
        if !self.asynchronous {
            return None;
        }
        match (self.async_frac_needed, self.async_sleep_secs) {
            (Some(frac_needed), Some(secs)) => Some(AsyncSettings {
                frac_needed,
                sleep: Duration::from_secs_f64(secs),
            }),
            _ => None,
        }
    }

    /// Whether bundling is on
    pub fn bundling(&self) -> bool {
        self.bundles_per_rank > 0
    }
}

fn check_required(map: &serde_json::Map<String, serde_json::Value>, required: &[&str]) -> Result<()> {
    for key in required {
        if !map.contains_key(*key) {
            return Err(PhError::config(format!("missing required option {}", key)));
        }
    }
    Ok(())
}

/// Builder for [`PhConfig`]
#[derive(Debug, Default)]
pub struct PhConfigBuilder {
    solver_name: Option<String>,
    iteration_limit: Option<usize>,
    default_rho: Option<Option<f64>>,
    convergence_threshold: Option<f64>,
    verbose: Option<bool>,
    display_progress: Option<bool>,
    display_timing: Option<bool>,
    iter0_solver_options: Option<SolverOptions>,
    iterk_solver_options: Option<SolverOptions>,
    async_frac_needed: Option<f64>,
    async_sleep: Option<Duration>,
    asynchronous: bool,
    probability_tolerance: Option<f64>,
    bundles_per_rank: usize,
    tee_rank0_solves: bool,
    persistent_refresh: RefreshGranularity,
    rho_setter_kwargs: serde_json::Value,
}

impl PhConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the solver name
    pub fn solver_name(mut self, name: impl Into<String>) -> Self {
        self.solver_name = Some(name.into());
        self
    }

    /// Set the iteration limit
    pub fn iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    /// Set the default proximal coefficient
    pub fn default_rho(mut self, rho: f64) -> Self {
        self.default_rho = Some(Some(rho));
        self
    }

    /// Declare that no default rho exists (a rho setter must supply them)
    pub fn without_default_rho(mut self) -> Self {
        self.default_rho = Some(None);
        self
    }

    /// Set the convergence threshold
    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }

    /// Enable or disable verbose tracing
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = Some(enabled);
        self
    }

    /// Enable or disable progress output
    pub fn display_progress(mut self, enabled: bool) -> Self {
        self.display_progress = Some(enabled);
        self
    }

    /// Enable or disable timing output
    pub fn display_timing(mut self, enabled: bool) -> Self {
        self.display_timing = Some(enabled);
        self
    }

    /// Set iteration-zero solver options
    pub fn iter0_solver_options(mut self, options: SolverOptions) -> Self {
        self.iter0_solver_options = Some(options);
        self
    }

    /// Set steady-state solver options
    pub fn iterk_solver_options(mut self, options: SolverOptions) -> Self {
        self.iterk_solver_options = Some(options);
        self
    }

    /// Switch to the asynchronous variant
    pub fn asynchronous(mut self, frac_needed: f64, sleep: Duration) -> Self {
        self.asynchronous = true;
        self.async_frac_needed = Some(frac_needed);
        self.async_sleep = Some(sleep);
        self
    }

    /// Set the probability tolerance
    pub fn probability_tolerance(mut self, tolerance: f64) -> Self {
        self.probability_tolerance = Some(tolerance);
        self
    }

    /// Set the number of bundles per worker
    pub fn bundles_per_rank(mut self, bundles: usize) -> Self {
        self.bundles_per_rank = bundles;
        self
    }

    /// Show solver output for rank 0 solves
    pub fn tee_rank0_solves(mut self, enabled: bool) -> Self {
        self.tee_rank0_solves = enabled;
        self
    }

    /// Set the persistent-solver refresh granularity
    pub fn persistent_refresh(mut self, granularity: RefreshGranularity) -> Self {
        self.persistent_refresh = granularity;
        self
    }

    /// Set the keyword arguments passed to the rho setter
    pub fn rho_setter_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.rho_setter_kwargs = kwargs;
        self
    }

    /// Build the configuration, failing on the first missing required option
    pub fn build(self) -> Result<PhConfig> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| PhError::config(format!("missing required option {}", name)))
        }

        let config = PhConfig {
            solver_name: required(self.solver_name, "solver_name")?,
            iteration_limit: required(self.iteration_limit, "iteration_limit")?,
            default_rho: required(self.default_rho, "default_rho")?,
            convergence_threshold: required(self.convergence_threshold, "convergence_threshold")?,
            verbose: required(self.verbose, "verbose")?,
            display_progress: required(self.display_progress, "display_progress")?,
            display_timing: required(self.display_timing, "display_timing")?,
            iter0_solver_options: required(self.iter0_solver_options, "iter0_solver_options")?,
            iterk_solver_options: required(self.iterk_solver_options, "iterk_solver_options")?,
            asynchronous: self.asynchronous,
            async_frac_needed: self.async_frac_needed,
            async_sleep_secs: self.async_sleep.map(|d| d.as_secs_f64()),
            probability_tolerance: self
                .probability_tolerance
                .unwrap_or(DEFAULT_PROBABILITY_TOLERANCE),
            bundles_per_rank: self.bundles_per_rank,
            tee_rank0_solves: self.tee_rank0_solves,
            persistent_refresh: self.persistent_refresh,
            rho_setter_kwargs: self.rho_setter_kwargs,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn complete_builder() -> PhConfigBuilder {
        PhConfig::builder()
            .solver_name("quadratic")
            .iteration_limit(50)
            .default_rho(1.0)
            .convergence_threshold(1e-7)
            .verbose(false)
            .display_progress(false)
            .display_timing(false)
            .iter0_solver_options(SolverOptions::new())
            .iterk_solver_options(SolverOptions::new())
    }

    #[test]
    fn test_builder_complete() {
        let config = complete_builder().build().unwrap();
        assert_eq!(config.iteration_limit, 50);
        assert_eq!(config.default_rho, Some(1.0));
        assert_eq!(config.probability_tolerance, DEFAULT_PROBABILITY_TOLERANCE);
        assert!(config.async_settings().is_none());
        assert!(!config.bundling());
    }

    #[test]
    fn test_builder_missing_option() {
        let err = PhConfig::builder()
            .solver_name("quadratic")
            .iteration_limit(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, PhError::Config(ref m) if m.contains("default_rho")));
    }

    #[test]
    fn test_builder_async_validation() {
        let err = complete_builder()
            .asynchronous(1.5, Duration::from_millis(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, PhError::Config(_)));

        let config = complete_builder()
            .asynchronous(0.5, Duration::from_millis(5))
            .build()
            .unwrap();
        let settings = config.async_settings().unwrap();
        assert_eq!(settings.frac_needed, 0.5);
        assert_eq!(settings.sleep, Duration::from_millis(5));
    }

    #[test]
    fn test_json_requires_all_options() {
        let json = r#"{
            "solver_name": "quadratic",
            "iteration_limit": 10,
            "default_rho": 1.0,
            "convergence_threshold": 1e-4,
            "verbose": false,
            "display_progress": false,
            "display_timing": false,
            "iter0_solver_options": {}
        }"#;
        let err = PhConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, PhError::Config(ref m) if m.contains("iterk_solver_options")));
    }

    #[test]
    fn test_json_null_default_rho_is_present() {
        let json = r#"{
            "solver_name": "quadratic",
            "iteration_limit": 10,
            "default_rho": null,
            "convergence_threshold": 1e-4,
            "verbose": false,
            "display_progress": false,
            "display_timing": false,
            "iter0_solver_options": {},
            "iterk_solver_options": {"threads": 1}
        }"#;
        let config = PhConfig::from_json_str(json).unwrap();
        assert_eq!(config.default_rho, None);
        assert_eq!(config.iterk_solver_options["threads"], serde_json::json!(1));
    }

    #[test]
    fn test_json_async_requires_quorum_options() {
        let json = r#"{
            "solver_name": "quadratic",
            "iteration_limit": 10,
            "default_rho": 1.0,
            "convergence_threshold": 1e-4,
            "verbose": false,
            "display_progress": false,
            "display_timing": false,
            "iter0_solver_options": {},
            "iterk_solver_options": {},
            "asynchronous": true,
            "async_frac_needed": 0.5
        }"#;
        let err = PhConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, PhError::Config(ref m) if m.contains("async_sleep_secs")));
    }

    #[test]
    fn test_json_rho_setter_kwargs() {
        let json = r#"{
            "solver_name": "quadratic",
            "iteration_limit": 10,
            "default_rho": null,
            "convergence_threshold": 1e-4,
            "verbose": false,
            "display_progress": false,
            "display_timing": false,
            "iter0_solver_options": {},
            "iterk_solver_options": {},
            "rho_setter_kwargs": {"scale": 2.5}
        }"#;
        let config = PhConfig::from_json_str(json).unwrap();
        assert_eq!(config.rho_setter_kwargs["scale"], 2.5);
    }

    #[test]
    fn test_from_file() {
        let config = complete_builder()
            .bundles_per_rank(2)
            .persistent_refresh(RefreshGranularity::Subproblem)
            .build()
            .unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = PhConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.bundles_per_rank, 2);
        assert!(loaded.rho_setter_kwargs.is_null());
        assert_eq!(loaded.persistent_refresh, RefreshGranularity::Subproblem);
        assert!(loaded.bundling());
    }
}
