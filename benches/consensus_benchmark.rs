//! Consensus Benchmarks
//!
//! Measures the per-iteration local work of a worker:
//! - Node vector accumulation (xbar/xsqbar numerators)
//! - Writing aggregates back into scenarios
//! - The W update

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use progressive_hedging::{ConsensusAggregator, ScenarioState, ScenarioTable, ScenarioTree, WeightUpdater};

/// Two-stage table with `scenarios` scenarios and `vars` ROOT variables
fn create_table(scenarios: usize, vars: usize) -> ScenarioTable {
    let names: Vec<String> = (0..scenarios).map(|i| format!("scen{}", i)).collect();
    let variables: Vec<String> = (0..vars).map(|v| format!("x{}", v)).collect();
    let tree = ScenarioTree::two_stage(variables, names.clone()).expect("tree");

    let mut table = ScenarioTable::new();
    for (i, name) in names.iter().enumerate() {
        let mut state = ScenarioState::new(&tree, name.as_str(), 1.0 / scenarios as f64, 1.0).expect("scenario");
        let values: Vec<f64> = (0..vars).map(|v| ((i * 31 + v * 7) % 100) as f64 / 10.0).collect();
        state.set_values(&values).expect("values");
        table.insert(state).expect("insert");
    }
    table
}

/// Benchmark node vector accumulation
fn bench_local_vectors(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_vectors");

    for scenarios in [10, 100, 1000].iter() {
        let table = create_table(*scenarios, 50);
        group.bench_with_input(BenchmarkId::new("two_stage", scenarios), scenarios, |b, _| {
            b.iter(|| black_box(ConsensusAggregator::local_vectors(&table, 0).expect("vectors")));
        });
    }

    group.finish();
}

/// Benchmark assigning aggregates and updating W
fn bench_assign_and_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_and_update");

    for vars in [10, 100, 500].iter() {
        let mut table = create_table(100, *vars);
        let global = ConsensusAggregator::local_vectors(&table, 0).expect("vectors");
        let updater = WeightUpdater::new();

        group.bench_with_input(BenchmarkId::new("vars", vars), vars, |b, _| {
            b.iter(|| {
                ConsensusAggregator::assign(&mut table, &global, 0, false).expect("assign");
                updater.update(&mut table, 0, false);
                black_box(table.at(0).slots[0].w);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_local_vectors, bench_assign_and_update);

criterion_main!(benches);
