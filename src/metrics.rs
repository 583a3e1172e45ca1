//! Metrics for the iteration engine
//!
//! ## Table of Contents
//! - **PhMetrics**: Prometheus registry with per-worker PH metrics
//! - **Timer**: Wall-clock timer for solves and phases

use crate::error::{PhError, Result};
use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};

/// Core metrics of one PH worker
pub struct PhMetrics {
    registry: Registry,

    // Iteration metrics
    /// Completed PH iterations (`ph_iterations_total`)
    pub iterations: Counter,
    /// Latest convergence metric (`ph_convergence`)
    pub convergence: Gauge,

    // Solve metrics
    /// Subproblem solves by `kind` (scenario/bundle) and `status` (ok/failed)
    pub solves: CounterVec,
    /// Solve wall time in seconds, by `kind`
    pub solve_duration: HistogramVec,

    // Asynchronous metrics
    /// Quorum-wait polls that did not reach quorum
    pub quorum_polls: Counter,
}

impl PhMetrics {
    /// Create a new metrics instance
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let iterations = Counter::new("ph_iterations_total", "Completed PH iterations")?;
        let convergence = Gauge::new("ph_convergence", "Latest convergence metric")?;

        let solves = CounterVec::new(
            Opts::new("ph_solves_total", "Subproblem solves"),
            &["kind", "status"],
        )?;
        let solve_duration = HistogramVec::new(
            HistogramOpts::new("ph_solve_duration_seconds", "Subproblem solve duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["kind"],
        )?;

        let quorum_polls = Counter::new("ph_quorum_polls_total", "Quorum polls that had to sleep")?;

        registry.register(Box::new(iterations.clone()))?;
        registry.register(Box::new(convergence.clone()))?;
        registry.register(Box::new(solves.clone()))?;
        registry.register(Box::new(solve_duration.clone()))?;
        registry.register(Box::new(quorum_polls.clone()))?;

        Ok(Self {
            registry,
            iterations,
            convergence,
            solves,
            solve_duration,
            quorum_polls,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished iteration and its convergence value
    pub fn record_iteration(&self, convergence: f64) {
        self.iterations.inc();
        self.convergence.set(convergence);
    }

    /// Record one subproblem solve
    pub fn record_solve(&self, bundle: bool, success: bool, duration_secs: f64) {
        let kind = if bundle { "bundle" } else { "scenario" };
        let status = if success { "ok" } else { "failed" };
        self.solves.with_label_values(&[kind, status]).inc();
        self.solve_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Record a quorum poll that did not reach quorum
    pub fn record_quorum_poll(&self) {
        self.quorum_polls.inc();
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PhError::internal(format!("Encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| PhError::internal(format!("UTF8 error: {}", e)))
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop and return elapsed seconds
    pub fn stop(self) -> f64 {
        self.elapsed_secs()
    }
}
