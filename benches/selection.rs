//! Selection and generation-cycle benchmarks.
//!
//! Budget reference:
//! - Parent selection, 1 000-agent pool:   P50 <1ms
//! - Generation build + close, 16 children: P50 <5ms

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_evolution_orchestrator::archive::InMemoryArchive;
use tokio_evolution_orchestrator::backend::ChannelBackend;
use tokio_evolution_orchestrator::population::{PopulationConfig, PopulationManager};
use tokio_evolution_orchestrator::{Agent, AgentStatus, Fitness, SelectionEngine, SelectionMethod};

fn pool(size: usize) -> Vec<Agent> {
    (0..size)
        .map(|i| {
            let mut agent = Agent::seed(format!("agent-{i}"))
                .with_fitness(Fitness::with_accuracy((i % 100) as f64 / 100.0));
            agent.metadata.children_count = (i % 7) as u32;
            agent
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Parent selection
// ═══════════════════════════════════════════════════════════════════════════

fn bench_selection_methods(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_parents");

    for size in [10usize, 100, 1000] {
        let agents = pool(size);
        for method in [
            SelectionMethod::ScoreProp,
            SelectionMethod::ScoreChildProp,
            SelectionMethod::Tournament,
            SelectionMethod::Random,
        ] {
            let engine = SelectionEngine::seeded(42);
            group.bench_with_input(
                BenchmarkId::new(method.as_str(), size),
                &agents,
                |b, agents| {
                    b.iter(|| {
                        let picks = engine.select_with(method, black_box(agents), 8);
                        black_box(picks)
                    })
                },
            );
        }
    }

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Generation cycle
// ═══════════════════════════════════════════════════════════════════════════

fn bench_generation_cycle(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    c.bench_function("generation_build_and_close_16", |b| {
        b.to_async(&rt).iter(|| async {
            let archive = Arc::new(InMemoryArchive::with_seeds(pool(8)));
            let (backend, mut rx) = ChannelBackend::new(64);
            let config = PopulationConfig {
                population_size: 16,
                seed: Some(7),
                ..PopulationConfig::default()
            };
            let mgr = PopulationManager::new(archive, Arc::new(backend), config);

            let ids = mgr.create_next_generation().await.expect("generation");
            for id in &ids {
                let _ = rx.recv().await;
                mgr.update_agent_status(id, AgentStatus::Evaluated, Some(Fitness::with_accuracy(0.5)))
                    .await
                    .expect("status");
            }
            black_box(mgr.transition_generation().await.expect("transition"));
        })
    });
}

criterion_group!(benches, bench_selection_methods, bench_generation_cycle);
criterion_main!(benches);
