//! Table serializer throughput benchmarks.
//!
//! - **flatten**: linearizing whole tables of growing height.
//! - **split_into_chunks**: budgeted chunking in both split modes over a
//!   sweep of chunk budgets.
//! - **truncate_to_budget**: thinning tall tables down to the source budget.
//!
//! Token counts use the whitespace budgeter, so the numbers measure the
//! serializer itself rather than a model tokenizer.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench serializer_throughput
//! ```

use criterion::{BenchmarkId, Criterion, Throughput};
use headwater::budget::WhitespaceBudgeter;
use headwater::common::{Cell, TableModel};
use headwater::serializer::{SplitMode, TableSerializer, flatten};
use indexmap::IndexSet;
use rand::prelude::*;
use rand::rngs::SmallRng;

// ============================================================================
// Test data generators
// ============================================================================

const WORDS: [&str; 12] = [
    "north", "river", "station", "league", "county", "season", "union", "party",
    "harbor", "district", "club", "valley",
];

/// A table of `num_rows` rows with alternating text and number columns. Text
/// cells hold 1-4 words.
fn generate_table(num_rows: usize, num_columns: usize, seed: u64) -> TableModel {
    let mut rng = SmallRng::seed_from_u64(seed);
    let header: Vec<String> = (0..num_columns).map(|c| format!("column {c}")).collect();
    let types: Vec<String> = (0..num_columns)
        .map(|c| if c % 2 == 0 { "text" } else { "number" }.to_string())
        .collect();
    let rows = (0..num_rows)
        .map(|_| {
            (0..num_columns)
                .map(|c| {
                    if c % 2 == 0 {
                        let words: Vec<&str> = (0..rng.random_range(1..=4))
                            .filter_map(|_| WORDS.choose(&mut rng).copied())
                            .collect();
                        Cell::from(words.join(" "))
                    } else {
                        Cell::from(rng.random_range(0..100_000i64))
                    }
                })
                .collect()
        })
        .collect();
    match TableModel::new(header, types, rows, IndexSet::new()) {
        Ok(table) => table,
        Err(e) => panic!("generated table is malformed: {e}"),
    }
}

// ============================================================================
// Serializer Benchmarks
// ============================================================================

fn bench_flatten(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten");
    group.noise_threshold(0.05);

    for num_rows in [16, 128, 1024] {
        let table = generate_table(num_rows, 6, 7);
        group.throughput(Throughput::Elements(num_rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", num_rows), &table, |b, table| {
            b.iter(|| flatten(table, 1));
        });
    }
    group.finish();
}

fn bench_split_into_chunks(c: &mut Criterion) {
    let budgeter = WhitespaceBudgeter;
    let serializer = TableSerializer::new(&budgeter);
    let table = generate_table(512, 6, 11);
    let query = "select c1 from w order by c2_number desc limit 1";

    let mut group = c.benchmark_group("split_into_chunks");
    group.sample_size(50);
    group.noise_threshold(0.05);
    group.throughput(Throughput::Elements(table.num_rows() as u64));

    for mode in [SplitMode::Greedy, SplitMode::Average] {
        for budget in [256, 512, 1024] {
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), budget),
                &budget,
                |b, &budget| {
                    b.iter(|| serializer.split_into_chunks(&table, query, budget, mode));
                },
            );
        }
    }
    group.finish();
}

fn bench_truncate_to_budget(c: &mut Criterion) {
    let budgeter = WhitespaceBudgeter;
    let serializer = TableSerializer::new(&budgeter);

    let mut group = c.benchmark_group("truncate_to_budget");
    group.noise_threshold(0.05);

    for num_rows in [128, 1024] {
        let table = generate_table(num_rows, 6, 13);
        group.throughput(Throughput::Elements(num_rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", num_rows), &table, |b, table| {
            let mut rng = SmallRng::seed_from_u64(42);
            b.iter(|| serializer.truncate_to_budget(table, 984, &mut rng));
        });
    }
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(2))
        .measurement_time(std::time::Duration::from_secs(8))
        .configure_from_args();

    bench_flatten(&mut criterion);
    bench_split_into_chunks(&mut criterion);
    bench_truncate_to_budget(&mut criterion);

    criterion.final_summary();
}
