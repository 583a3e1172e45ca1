//! In-memory process group
//!
//! One [`LocalProcessGroup`] handle per worker task, all sharing a
//! rendezvous table. Collective calls on the same communicator are matched
//! by a per-label sequence number each worker advances locally, so members
//! must issue collectives on a communicator in the same order (the usual
//! collective contract). The last member to arrive computes the result and
//! wakes the others through a `watch` generation counter. Raising the
//! group's abort signal fails every collective still waiting for members.

use super::{Communicator, ProcessGroup, ReduceOp, WORLD};
use crate::error::{PhError, Result};
use crate::synchronizer::CancelSignal;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone)]
enum Payload {
    Floats(Vec<f64>),
    Value(serde_json::Value),
    Arrive,
}

#[derive(Debug)]
enum Outcome {
    Floats(Vec<f64>),
    Values(Vec<serde_json::Value>),
    Done,
    Failed(String),
}

#[derive(Debug)]
struct Round {
    expected: usize,
    contributions: BTreeMap<usize, Payload>,
    result: Option<Arc<Outcome>>,
    departed: usize,
}

impl Round {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            contributions: BTreeMap::new(),
            result: None,
            departed: 0,
        }
    }
}

struct Shared {
    name: String,
    size: usize,
    rounds: Mutex<HashMap<(String, u64), Round>>,
    generation: watch::Sender<u64>,
    board: DashMap<String, Vec<Option<Vec<f64>>>>,
    quit: CancelSignal,
    abort: CancelSignal,
}

/// In-memory [`ProcessGroup`] for workers running as tasks of one process
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl LocalProcessGroup {
    /// Create `size` connected handles, one per rank
    pub fn create(size: usize) -> Vec<Self> {
        Self::create_named("local", size)
    }

    /// Create `size` connected handles with a group name for logging
    pub fn create_named(name: impl Into<String>, size: usize) -> Vec<Self> {
        let (generation, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            name: name.into(),
            size,
            rounds: Mutex::new(HashMap::new()),
            generation,
            board: DashMap::new(),
            quit: CancelSignal::new(),
            abort: CancelSignal::new(),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
                sequences: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    /// A group of one; collectives return the local value
    pub fn single() -> Self {
        Self::create(1).remove(0)
    }

    fn next_sequence(&self, label: &str) -> u64 {
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(label.to_string()).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }

    async fn rendezvous<F>(
        &self,
        label: &str,
        expected: usize,
        payload: Payload,
        finish: F,
    ) -> Result<Arc<Outcome>>
    where
        F: FnOnce(&BTreeMap<usize, Payload>) -> Outcome,
    {
        let key = (label.to_string(), self.next_sequence(label));
        let mut rx = self.shared.generation.subscribe();

        let completed = {
            let mut rounds = self.shared.rounds.lock();
            let round = rounds
                .entry(key.clone())
                .or_insert_with(|| Round::new(expected));
            if round.expected != expected {
                return Err(PhError::communication(format!(
                    "collective {}#{} joined with {} members, expected {}",
                    key.0, key.1, expected, round.expected
                )));
            }
            if round.contributions.insert(self.rank, payload).is_some() {
                return Err(PhError::communication(format!(
                    "rank {} joined collective {}#{} twice",
                    self.rank, key.0, key.1
                )));
            }
            if round.contributions.len() == round.expected {
                let outcome = finish(&round.contributions);
                round.contributions.clear();
                round.result = Some(Arc::new(outcome));
                true
            } else {
                false
            }
        };

        if completed {
            trace!(group = %self.shared.name, label = %key.0, seq = key.1, "Collective complete");
            self.shared.generation.send_modify(|g| *g += 1);
        }

        let mut aborted = false;
        loop {
            {
                let mut rounds = self.shared.rounds.lock();
                let ready = match rounds.get_mut(&key) {
                    Some(round) => match &round.result {
                        Some(result) => {
                            let result = result.clone();
                            round.departed += 1;
                            Some((result, round.departed == round.expected))
                        }
                        None => None,
                    },
                    None => {
                        return Err(PhError::communication(format!(
                            "collective {}#{} vanished",
                            key.0, key.1
                        )));
                    }
                };
                if let Some((result, last)) = ready {
                    if last {
                        rounds.remove(&key);
                    }
                    return Ok(result);
                }
            }
            // a round completed before the abort still delivers its result
            if aborted {
                trace!(group = %self.shared.name, label = %key.0, seq = key.1, "Collective aborted");
                return Err(PhError::communication("group aborted"));
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|e| PhError::communication(e.to_string()))?;
                }
                _ = self.shared.abort.cancelled() => aborted = true,
            }
        }
    }
}

fn reduce(op: ReduceOp, contributions: &BTreeMap<usize, Payload>) -> Outcome {
    let mut acc: Option<Vec<f64>> = None;
    for (rank, payload) in contributions {
        let Payload::Floats(values) = payload else {
            return Outcome::Failed(format!("rank {} sent a non-numeric reduction payload", rank));
        };
        match acc.as_mut() {
            None => acc = Some(values.clone()),
            Some(acc) => {
                if acc.len() != values.len() {
                    return Outcome::Failed(format!(
                        "reduction length mismatch: rank {} sent {}, expected {}",
                        rank,
                        values.len(),
                        acc.len()
                    ));
                }
                op.combine(acc, values);
            }
        }
    }
    Outcome::Floats(acc.unwrap_or_default())
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    async fn all_reduce(&self, comm: &Communicator, op: ReduceOp, local: &[f64]) -> Result<Vec<f64>> {
        if !comm.contains(self.rank) {
            return Err(PhError::communication(format!(
                "rank {} is not a member of communicator {}",
                self.rank, comm.label
            )));
        }
        let outcome = self
            .rendezvous(
                &comm.label,
                comm.size(),
                Payload::Floats(local.to_vec()),
                |contributions| reduce(op, contributions),
            )
            .await?;
        match outcome.as_ref() {
            Outcome::Floats(values) => Ok(values.clone()),
            Outcome::Failed(msg) => Err(PhError::communication(msg.clone())),
            _ => Err(PhError::internal("all_reduce produced a non-numeric outcome")),
        }
    }

    async fn gather(&self, root: usize, value: serde_json::Value) -> Result<Option<Vec<serde_json::Value>>> {
        if root >= self.size() {
            return Err(PhError::communication(format!("gather root {} out of range", root)));
        }
        let label = format!("{}:gather:{}", WORLD, root);
        let outcome = self
            .rendezvous(&label, self.size(), Payload::Value(value), |contributions| {
                let mut values = Vec::with_capacity(contributions.len());
                for payload in contributions.values() {
                    match payload {
                        Payload::Value(v) => values.push(v.clone()),
                        _ => return Outcome::Failed("non-value gather payload".to_string()),
                    }
                }
                Outcome::Values(values)
            })
            .await?;
        match outcome.as_ref() {
            Outcome::Values(values) if self.rank == root => Ok(Some(values.clone())),
            Outcome::Values(_) => Ok(None),
            Outcome::Failed(msg) => Err(PhError::communication(msg.clone())),
            _ => Err(PhError::internal("gather produced an unexpected outcome")),
        }
    }

    async fn barrier(&self) -> Result<()> {
        let label = format!("{}:barrier", WORLD);
        let outcome = self
            .rendezvous(&label, self.size(), Payload::Arrive, |_| Outcome::Done)
            .await?;
        match outcome.as_ref() {
            Outcome::Done => Ok(()),
            Outcome::Failed(msg) => Err(PhError::communication(msg.clone())),
            _ => Err(PhError::internal("barrier produced an unexpected outcome")),
        }
    }

    fn post_contribution(&self, key: &str, contribution: Vec<f64>) -> Result<()> {
        let size = self.shared.size;
        let mut entry = self
            .shared
            .board
            .entry(key.to_string())
            .or_insert_with(|| vec![None; size]);
        entry[self.rank] = Some(contribution);
        Ok(())
    }

    fn read_contributions(&self, key: &str, len: usize) -> Result<Vec<f64>> {
        let mut sum = vec![0.0; len];
        if let Some(entry) = self.shared.board.get(key) {
            for (rank, contribution) in entry.iter().enumerate() {
                if let Some(values) = contribution {
                    if values.len() != len {
                        return Err(PhError::communication(format!(
                            "board {} holds {} values from rank {}, expected {}",
                            key,
                            values.len(),
                            rank,
                            len
                        )));
                    }
                    ReduceOp::Sum.combine(&mut sum, values);
                }
            }
        }
        Ok(sum)
    }

    fn quit_signal(&self) -> CancelSignal {
        self.shared.quit.clone()
    }

    fn abort_signal(&self) -> CancelSignal {
        self.shared.abort.clone()
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_all<F, Fut, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalProcessGroup) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalProcessGroup::create(size)
            .into_iter()
            .map(|g| tokio::spawn(f(g)))
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_all_reduce_sum_min_max() {
        let results = run_all(4, |g| async move {
            let world = Communicator::world(g.size());
            let r = g.rank() as f64;
            let sum = g.all_reduce(&world, ReduceOp::Sum, &[r, 1.0]).await.unwrap();
            let min = g.all_reduce(&world, ReduceOp::Min, &[r]).await.unwrap();
            let max = g.all_reduce(&world, ReduceOp::Max, &[r]).await.unwrap();
            (sum, min[0], max[0])
        })
        .await;
        for (sum, min, max) in results {
            assert_eq!(sum, vec![6.0, 4.0]);
            assert_eq!(min, 0.0);
            assert_eq!(max, 3.0);
        }
    }

    #[tokio::test]
    async fn test_scoped_reduce_excludes_non_members() {
        let results = run_all(3, |g| async move {
            let comm = Communicator::new("ROOT_0", vec![0, 2]);
            if comm.contains(g.rank()) {
                Some(g.all_reduce(&comm, ReduceOp::Sum, &[10.0 + g.rank() as f64]).await.unwrap())
            } else {
                None
            }
        })
        .await;
        assert_eq!(results[0], Some(vec![22.0]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], Some(vec![22.0]));
    }

    #[tokio::test]
    async fn test_gather_only_on_root() {
        let results = run_all(3, |g| async move {
            g.gather(0, serde_json::json!(g.rank())).await.unwrap()
        })
        .await;
        assert_eq!(
            results[0],
            Some(vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)])
        );
        assert!(results[1].is_none());
    }

    #[tokio::test]
    async fn test_barrier_and_repeated_collectives() {
        let results = run_all(3, |g| async move {
            let world = Communicator::world(g.size());
            let mut total = 0.0;
            for i in 0..10 {
                g.barrier().await.unwrap();
                total += g.all_reduce(&world, ReduceOp::Sum, &[i as f64]).await.unwrap()[0];
            }
            total
        })
        .await;
        assert!(results.iter().all(|&t| t == 135.0));
    }

    #[tokio::test]
    async fn test_length_mismatch_is_reported() {
        let results = run_all(2, |g| async move {
            let world = Communicator::world(g.size());
            let local = vec![1.0; g.rank() + 1];
            g.all_reduce(&world, ReduceOp::Sum, &local).await
        })
        .await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(PhError::Communication(_)))));
    }

    #[test]
    fn test_board_sums_latest_contributions() {
        let groups = LocalProcessGroup::create(3);
        groups[0].post_contribution("ROOT", vec![1.0, 0.0]).unwrap();
        groups[1].post_contribution("ROOT", vec![2.0, 0.0]).unwrap();
        groups[1].post_contribution("ROOT", vec![5.0, 1.0]).unwrap();
        assert_eq!(groups[2].read_contributions("ROOT", 2).unwrap(), vec![6.0, 1.0]);
        assert_eq!(groups[2].read_contributions("ROOT_1", 2).unwrap(), vec![0.0, 0.0]);
        assert!(groups[2].read_contributions("ROOT", 3).is_err());
    }

    #[test]
    fn test_quit_signal_shared_across_handles() {
        let groups = LocalProcessGroup::create(2);
        groups[1].quit_signal().cancel();
        assert!(groups[0].quit_signal().is_cancelled());
        assert!(!LocalProcessGroup::single().quit_signal().is_cancelled());
        assert!(!groups[0].abort_signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_releases_pending_collective() {
        let mut groups = LocalProcessGroup::create(2);
        let absent = groups.pop().unwrap();
        let waiting = groups.pop().unwrap();
        let pending = tokio::spawn(async move { waiting.barrier().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        absent.abort_signal().cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), pending)
            .await
            .expect("barrier still blocked after abort")
            .unwrap();
        assert!(matches!(result, Err(PhError::Communication(msg)) if msg == "group aborted"));

        // later collectives fail immediately
        let world = Communicator::world(absent.size());
        let late = absent.all_reduce(&world, ReduceOp::Sum, &[1.0]).await;
        assert!(matches!(late, Err(PhError::Communication(_))));
    }

    #[tokio::test]
    async fn test_quit_does_not_abort_collectives() {
        let results = run_all(2, |g| async move {
            g.quit_signal().cancel();
            g.barrier().await
        })
        .await;
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
