//! Criterion benchmarks for reconciliation
//!
//! Measures:
//! - Steady-state reconcile (nothing to change)
//! - Policy enforcement with many misrouted clients
//! - Access-policy rendering

use bridge_audio_benchmarks::busy_appliance;
use bridge_audio_core::domain::memory::InMemoryAudioServer;
use bridge_audio_core::domain::{
    AccessRule, AudioManagerReconciler, IsolationPolicyEngine, ReconcilerSettings,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        debounce: Duration::ZERO,
        ..Default::default()
    }
}

fn reconciler(server: Arc<InMemoryAudioServer>) -> AudioManagerReconciler {
    AudioManagerReconciler::new(server, settings(), AccessRule::builtin(0))
        .expect("default settings are valid")
}

/// Benchmark a run that finds the graph already converged
fn bench_steady_state(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let server = Arc::new(busy_appliance(0));
    let reconciler = reconciler(server);
    rt.block_on(reconciler.reconcile_now()).expect("first run");

    c.bench_function("reconcile_steady_state", |b| {
        b.iter(|| black_box(rt.block_on(reconciler.reconcile_now()).expect("reconcile")))
    });
}

/// Benchmark a cold start followed by moving misrouted clients
fn bench_enforcement_scaling(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("reconcile_enforcement");

    for clients in [1, 8, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            b.iter_with_setup(
                || reconciler(Arc::new(busy_appliance(clients))),
                |reconciler| black_box(rt.block_on(reconciler.reconcile_now()).expect("reconcile")),
            )
        });
    }

    group.finish();
}

/// Benchmark rendering the access-policy document
fn bench_policy_render(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let server = Arc::new(busy_appliance(0));
    let reconciler = reconciler(server);
    let snapshot = rt.block_on(reconciler.snapshot()).expect("snapshot");
    let resolved = reconciler.policy().resolve(&reconciler.inventory(&snapshot));

    c.bench_function("policy_render", |b| {
        b.iter(|| black_box(IsolationPolicyEngine::render(black_box(&resolved))))
    });

    c.bench_function("policy_enumerate", |b| {
        b.iter(|| {
            black_box(IsolationPolicyEngine::enumerate(
                &resolved,
                black_box("Google Chrome"),
                &snapshot.nodes,
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_steady_state,
    bench_enforcement_scaling,
    bench_policy_render,
);

criterion_main!(benches);
