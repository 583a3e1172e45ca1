//! Quorum-based asynchronous reduction
//!
//! Replaces the node-scoped all-reduce of the synchronous path with a
//! non-blocking contribution board. Each worker stamps its ROOT vector
//! with the seconds elapsed since the agreed run start, posts every node
//! vector, and then waits until enough workers have posted a stamp at or
//! after its own. Aggregates read after the wait may be stale or partial.
//!
//! ## Table of Contents
//! - **CancelSignal**: Shared quit flag observed at every poll
//! - **AsyncSynchronizer**: Post, quorum-wait, read back

use crate::comm::{ProcessGroup, ReduceOp};
use crate::config::AsyncSettings;
use crate::consensus::NodeVectors;
use crate::error::{PhError, Result};
use crate::metrics::PhMetrics;
use crate::tree::ROOT;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Cooperative cancellation shared by every worker of a group.
///
/// Clones observe the same flag. Once raised it stays raised.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Create a lowered signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal
    pub fn cancel(&self) {
        self.tx.send_if_modified(|raised| {
            let changed = !*raised;
            *raised = true;
            changed
        });
    }

    /// Whether the signal has been raised
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn board_key(node: &str) -> String {
    format!("xbar:{}", node)
}

/// Quorum wait over the contribution board
pub struct AsyncSynchronizer {
    settings: AsyncSettings,
    cancel: CancelSignal,
    epoch_micros: i64,
    metrics: Option<Arc<PhMetrics>>,
}

impl AsyncSynchronizer {
    /// Create a synchronizer with an explicit run-start epoch (microseconds)
    pub fn new(settings: AsyncSettings, cancel: CancelSignal, epoch_micros: i64) -> Self {
        Self {
            settings,
            cancel,
            epoch_micros,
            metrics: None,
        }
    }

    /// Agree on the run-start epoch (earliest local clock over the group)
    pub async fn establish(group: &dyn ProcessGroup, settings: AsyncSettings) -> Result<Self> {
        let local = Utc::now().timestamp_micros() as f64;
        let epoch = crate::comm::all_reduce_scalar(group, ReduceOp::Min, local).await?;
        debug!(rank = group.rank(), epoch, "Asynchronous run epoch agreed");
        Ok(Self::new(settings, group.quit_signal(), epoch as i64))
    }

    /// Record quorum polls in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PhMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The signal ending quorum waits
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Raise the shared quit signal
    pub fn signal_quit(&self) {
        self.cancel.cancel();
    }

    /// Seconds since the run epoch; strictly positive so an unposted slot never counts
    pub fn elapsed_secs(&self) -> f64 {
        let micros = Utc::now().timestamp_micros() - self.epoch_micros;
        (micros as f64 / 1e6).max(f64::MIN_POSITIVE)
    }

    /// Post local node vectors and wait for quorum.
    ///
    /// `local[ROOT]` must hold `2 * root_len + size` entries; this worker's
    /// timestamp goes in slot `2 * root_len + rank`. Returns whatever
    /// aggregate is on the board once quorum is met or the wait is cancelled.
    pub async fn exchange(&self, group: &dyn ProcessGroup, mut local: NodeVectors, root_len: usize) -> Result<NodeVectors> {
        let rank = group.rank();
        let size = group.size();
        let stamp = self.elapsed_secs();

        let root = local
            .get_mut(ROOT)
            .ok_or_else(|| PhError::state("asynchronous exchange without a ROOT vector"))?;
        if root.len() != 2 * root_len + size {
            return Err(PhError::state(format!(
                "ROOT vector has {} entries, expected {}",
                root.len(),
                2 * root_len + size
            )));
        }
        root[2 * root_len + rank] = stamp;

        for (node, vector) in &local {
            group.post_contribution(&board_key(node), vector.clone())?;
        }

        let needed = self.settings.frac_needed * size as f64;
        let mut polls = 0u64;
        loop {
            let global = Self::read(group, &local)?;
            let stamps = global
                .get(ROOT)
                .map(|v| &v[2 * root_len..])
                .unwrap_or(&[]);
            let arrived = stamps.iter().filter(|&&t| t >= stamp).count();

            if arrived as f64 >= needed {
                debug!(rank, arrived, polls, "Quorum reached");
                return Ok(global);
            }
            if self.cancel.is_cancelled() {
                info!(rank, arrived, polls, "Quorum wait cancelled");
                return Ok(global);
            }

            polls += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_quorum_poll();
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.sleep) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn read(group: &dyn ProcessGroup, local: &NodeVectors) -> Result<NodeVectors> {
        local
            .iter()
            .map(|(node, vector)| {
                group
                    .read_contributions(&board_key(node), vector.len())
                    .map(|sum| (node.clone(), sum))
            })
            .collect()
    }
}
