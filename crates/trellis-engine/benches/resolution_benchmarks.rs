//! Benchmarks for graph resolution, caching and cycle execution.
//!
//! Run with: cargo bench -p trellis-engine

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use trellis_engine::{
    ComputationTarget, ComputationTargetSpecification, ComputationTargetType, ComputationCache, ComputeEngine,
    ComputeEngineBuilder, ConventionMarketDataAvailability, DependencyGraphBuilder, FunctionBuilder,
    FunctionCatalogue, FunctionDefinition, FunctionResult, InMemoryFunctionRepository, InMemoryMarketDataProvider,
    InMemoryTargetResolver, ValueProperties, ValueRequirement, ValueSpecification, ViewDefinition,
};
use trellis_traits::value::DataValue;

// =============================================================================
// TEST DATA GENERATORS
// =============================================================================

fn on_self(
    name: &'static str,
) -> impl Fn(&ComputationTarget, &ValueRequirement) -> FunctionResult<Vec<ValueRequirement>> + Send + Sync + 'static {
    move |target, _| Ok(vec![ValueRequirement::new(name, target.specification.clone())])
}

/// Per-security risk stack: Spot -> PV -> Delta, Gamma; Vol -> Vega.
fn risk_functions() -> Vec<Arc<dyn FunctionDefinition>> {
    vec![
        FunctionBuilder::new("PV", ComputationTargetType::Security)
            .output("PV")
            .requires(on_self("Spot"))
            .computes(|_, inputs| Ok(DataValue::Double(inputs.f64_named("Spot")? * 100.0)))
            .build_arc(),
        FunctionBuilder::new("Delta", ComputationTargetType::Security)
            .output("Delta")
            .requires(on_self("PV"))
            .computes(|_, inputs| Ok(DataValue::Double(inputs.f64_named("PV")? / 100.0)))
            .build_arc(),
        FunctionBuilder::new("Gamma", ComputationTargetType::Security)
            .output("Gamma")
            .requires(on_self("PV"))
            .computes(|_, inputs| Ok(DataValue::Double(inputs.f64_named("PV")? * 1e-4)))
            .build_arc(),
        FunctionBuilder::new("Vega", ComputationTargetType::Security)
            .output("Vega")
            .requires(on_self("Vol"))
            .computes(|_, inputs| Ok(DataValue::Double(inputs.f64_named("Vol")? * 0.4)))
            .build_arc(),
    ]
}

fn security(i: usize) -> ComputationTargetSpecification {
    ComputationTargetSpecification::security(format!("SEC_{:05}", i))
}

fn requirements(securities: usize) -> Vec<ValueRequirement> {
    (0..securities)
        .flat_map(|i| {
            ["PV", "Delta", "Gamma", "Vega"]
                .into_iter()
                .map(move |name| ValueRequirement::new(name, security(i)))
        })
        .collect()
}

fn resolver(securities: usize) -> Arc<InMemoryTargetResolver> {
    let resolver = InMemoryTargetResolver::new();
    for i in 0..securities {
        resolver.insert(ComputationTarget::new(security(i)));
    }
    Arc::new(resolver)
}

fn repository() -> Arc<InMemoryFunctionRepository> {
    let repository = InMemoryFunctionRepository::new();
    for function in risk_functions() {
        repository.register_function(function).unwrap();
    }
    Arc::new(repository)
}

fn graph_builder(securities: usize) -> DependencyGraphBuilder {
    DependencyGraphBuilder::new(repository(), resolver(securities))
        .with_market_data(Arc::new(ConventionMarketDataAvailability::new(["Spot", "Vol"])))
}

fn build_engine(securities: usize) -> (ComputeEngine, Arc<InMemoryMarketDataProvider>) {
    let feed = Arc::new(InMemoryMarketDataProvider::new());
    for i in 0..securities {
        let id = security(i).id;
        feed.set(format!("{}.Spot", id), 100.0 + i as f64);
        feed.set(format!("{}.Vol", id), 0.2);
    }
    let engine = ComputeEngineBuilder::new()
        .with_repository(repository())
        .with_catalogue(Arc::new(FunctionCatalogue::new().with_functions(risk_functions())))
        .with_target_resolver(resolver(securities))
        .with_market_data(feed.clone())
        .with_availability(Arc::new(ConventionMarketDataAvailability::new(["Spot", "Vol"])))
        .with_local_workers(4)
        .build()
        .unwrap();
    (engine, feed)
}

// =============================================================================
// GRAPH BUILDING
// =============================================================================

fn bench_graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");

    for securities in [10, 100, 1000] {
        let builder = graph_builder(securities);
        let requirements = requirements(securities);
        group.throughput(Throughput::Elements(requirements.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(securities), &requirements, |b, requirements| {
            b.iter(|| builder.build(black_box(requirements)))
        });
    }

    group.finish();
}

fn bench_graph_queries(c: &mut Criterion) {
    let output = graph_builder(1000).build(&requirements(1000));
    let graph = output.graph;
    let leaves = graph.market_data_nodes();

    c.bench_function("topological_order_1000", |b| b.iter(|| graph.topological_order()));
    c.bench_function("downstream_of_all_leaves_1000", |b| {
        b.iter(|| graph.downstream_of(black_box(leaves.iter().copied())))
    });
}

// =============================================================================
// CACHE
// =============================================================================

fn bench_cache(c: &mut Criterion) {
    let cache = ComputationCache::new();
    let specs: Vec<ValueSpecification> = (0..10_000)
        .map(|i| ValueSpecification::new("PV", security(i), ValueProperties::none()))
        .collect();
    for (i, spec) in specs.iter().enumerate() {
        cache.put(spec.clone(), DataValue::Double(i as f64));
    }

    c.bench_function("cache_get_10000", |b| {
        b.iter(|| {
            for spec in &specs {
                black_box(cache.get(spec));
            }
        })
    });
}

// =============================================================================
// CYCLES
// =============================================================================

fn bench_cycles(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("cycle");
    group.sample_size(20);

    for securities in [10, 100] {
        let (engine, feed) = rt.block_on(async { build_engine(securities) });
        let view = engine
            .create_view(ViewDefinition::new("bench").with_requirements(requirements(securities)))
            .unwrap();
        rt.block_on(view.run_cycle()).unwrap();

        // One security moves per cycle.
        let mut tick = 0.0;
        group.bench_function(BenchmarkId::new("incremental", securities), |b| {
            b.iter(|| {
                tick += 0.01;
                feed.set("SEC_00000.Spot", 100.0 + tick);
                rt.block_on(view.run_cycle())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_graph_build, bench_graph_queries, bench_cache, bench_cycles);
criterion_main!(benches);
