#![allow(clippy::panic)]

use codspeed_criterion_compat::{Criterion, Throughput, criterion_group, criterion_main};
use sparindex::algebra::{GraphPattern, NamedNode, TriplePattern, Variable};
use sparindex::{
    ExternalIndex, IndexCatalogue, IndexPlanner, MemoryPcjStorage, PcjDefinition, PcjIndex,
    PcjStorage, PlanningLimits, PlanningMode,
};
use std::sync::Arc;

fn pattern(s: &str, p: usize, o: &str) -> GraphPattern {
    TriplePattern::new(
        Variable::new_unchecked(s),
        NamedNode::new_unchecked(format!("http://example.com/p{p}")),
        Variable::new_unchecked(o),
    )
    .into()
}

/// A chain `?v0 p0 ?v1 . ?v1 p1 ?v2 ...` with the given predicates
fn chain(predicates: impl IntoIterator<Item = usize>) -> GraphPattern {
    let Some(chain) = GraphPattern::join_all(
        predicates
            .into_iter()
            .enumerate()
            .map(|(i, p)| pattern(&format!("v{i}"), p, &format!("v{}", i + 1))),
    ) else {
        panic!("empty chain");
    };
    chain
}

/// One index per pair of consecutive predicates, all overlapping
fn catalogue(length: usize) -> IndexCatalogue {
    let storage: Arc<dyn PcjStorage> = Arc::new(MemoryPcjStorage::new());
    let Ok(catalogue) = IndexCatalogue::new((0..length - 1).map(|i| -> Arc<dyn ExternalIndex> {
        let Ok(index) = PcjIndex::new(
            PcjDefinition {
                id: format!("pcj{i}"),
                query: chain([i, i + 1]),
                cardinality: 1_000,
            },
            Arc::clone(&storage),
        ) else {
            panic!("invalid index");
        };
        Arc::new(index)
    })) else {
        panic!("invalid catalogue");
    };
    catalogue
}

fn exhaustive_enumeration(c: &mut Criterion) {
    let mut group = c.benchmark_group("exhaustive enumeration");
    for length in [4, 8, 12] {
        let query = chain(0..length);
        let planner = IndexPlanner::new(catalogue(length))
            .with_mode(PlanningMode::Exhaustive)
            .with_limits(PlanningLimits::unlimited());
        group.throughput(Throughput::Elements(length.try_into().unwrap_or(u64::MAX)));
        group.bench_function(format!("chain of {length} patterns"), |b| {
            b.iter(|| {
                let Ok(plans) = planner.plans(&query) else {
                    panic!("planning failed");
                };
                plans.count()
            })
        });
    }
    group.finish();
}

fn modes(c: &mut Criterion) {
    let query = chain(0..12);
    let catalogue = catalogue(12);
    for mode in [PlanningMode::Greedy, PlanningMode::Optimal] {
        let planner = IndexPlanner::new(catalogue.clone()).with_mode(mode);
        c.bench_function(&format!("{mode:?} planning of 12 patterns"), |b| {
            b.iter(|| planner.optimize(&query).is_ok())
        });
    }
}

criterion_group!(planning, exhaustive_enumeration, modes);

criterion_main!(planning);
