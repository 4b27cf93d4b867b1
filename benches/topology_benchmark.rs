//! Benchmarks for topology matching and test selection
//!
//! Measures the work done once per session before any host is touched:
//!
//! 1. **Topology matching**: `satisfies` and equality over topologies with a
//!    growing number of domains and roles
//! 2. **Selection**: expansion, filtering and ordering of large test suites
//! 3. **Command building**: CLI argument rendering for both shells

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use multihost::connection::Shell;
use multihost::marks::{KnownTopologies, TopologyMark};
use multihost::options::MultihostOptions;
use multihost::runner::{expand, order, select, TestCase, TestItem};
use multihost::topology::{Topology, TopologyDomain};
use multihost::utils::{CliArgs, CliBuilder};

// ============================================================================
// Fixtures
// ============================================================================

fn topology(domains: usize, roles: usize, count: usize) -> Topology {
    Topology::new((0..domains).map(|d| {
        TopologyDomain::new(
            format!("domain{d}"),
            (0..roles).map(|r| (format!("role{r}"), count)),
        )
    }))
    .unwrap()
}

fn known(marks: usize) -> KnownTopologies {
    (0..marks).fold(KnownTopologies::new(), |known, i| {
        known
            .with(TopologyMark::new(format!("mark{i}"), topology(1 + i % 3, 1 + i % 4, 1)))
            .unwrap()
    })
}

fn suite(tests: usize, known: &KnownTopologies) -> Vec<TestItem> {
    let names: Vec<String> = known.iter().map(|m| m.name().to_string()).collect();
    let members: Vec<&str> = names.iter().map(String::as_str).collect();
    let group = known.group("all", &members).unwrap();

    (0..tests)
        .flat_map(|i| {
            let case = TestCase::new(format!("test_{i}"), |_| async { Ok(()) }).topology(group.clone());
            expand(Arc::new(case))
        })
        .collect()
}

// ============================================================================
// Topology matching
// ============================================================================

fn bench_satisfies(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology_satisfies");

    for size in [1, 4, 16, 64] {
        let provided = topology(size, size, 2);
        let required = topology(size, size, 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(provided.satisfies(black_box(&required))))
        });
    }

    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let topo = topology(8, 8, 2);
    c.bench_function("topology_export_roundtrip", |b| {
        b.iter(|| Topology::from_export(&black_box(&topo).export()).unwrap())
    });
}

// ============================================================================
// Selection
// ============================================================================

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    let known = known(12);
    let provided = topology(2, 3, 1);
    let options = MultihostOptions::default();

    for tests in [10, 100, 1000] {
        let items = suite(tests, &known);
        group.throughput(Throughput::Elements(items.len() as u64));
        group.bench_with_input(BenchmarkId::new("select_and_order", tests), &items, |b, items| {
            b.iter(|| {
                let selection = select(items.clone(), &provided, &options);
                black_box(order(selection.selected))
            })
        });
    }

    group.finish();
}

// ============================================================================
// Command building
// ============================================================================

fn bench_cli_builder(c: &mut Criterion) {
    let mut group = c.benchmark_group("cli_builder");

    let args = CliArgs::new()
        .value("name", "user1")
        .value("uid", 1000_i64)
        .value("groups", vec!["wheel", "users", "admins"])
        .switch("create-home", true)
        .switch("system", false)
        .value("comment", "A user with 'quotes'");

    for shell in [Shell::Bash, Shell::Powershell] {
        let builder = CliBuilder::new(shell);
        group.bench_function(shell.name(), |b| {
            b.iter(|| black_box(builder.command("useradd", black_box(&args))))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_satisfies,
    bench_export,
    bench_selection,
    bench_cli_builder
);
criterion_main!(benches);
