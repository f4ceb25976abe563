//! Benchmarks for the context switch path.
//!
//! Run with: `cargo bench --bench switch_bench`
//!
//! Uses the headless binding, so the numbers are the manager's own overhead
//! (queue turn, locking, lifecycle bookkeeping) without driver cost.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use gpu_session::{
    HeadlessBinding, ManagerSettings, ResourceDescriptor, SessionConfig, SessionManager,
    SuspendPolicy,
};

// =============================================================================
// Setup
// =============================================================================

fn manager(policy: SuspendPolicy) -> SessionManager<HeadlessBinding> {
    SessionManager::new(
        HeadlessBinding::new(),
        ManagerSettings {
            suspend_policy: policy,
            ..Default::default()
        },
    )
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("switch_ping_pong");
    for policy in [SuspendPolicy::RetainOnSuspend, SuspendPolicy::ReleaseOnSuspend] {
        let m = manager(policy);
        let a = m.create_session(SessionConfig::labeled("a")).unwrap();
        let b = m.create_session(SessionConfig::labeled("b")).unwrap();
        m.switch_to(a).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &(a, b),
            |bench, &(a, b)| {
                bench.iter(|| {
                    black_box(m.switch_to(b).unwrap());
                    black_box(m.switch_to(a).unwrap());
                });
            },
        );
    }
    group.finish();
}

fn bench_noop_switch(c: &mut Criterion) {
    let m = manager(SuspendPolicy::RetainOnSuspend);
    let a = m.create_session(SessionConfig::default()).unwrap();
    m.switch_to(a).unwrap();

    c.bench_function("switch_to_active", |bench| {
        bench.iter(|| black_box(m.switch_to(black_box(a)).unwrap()));
    });
}

fn bench_resource_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_lookup");
    for count in [16usize, 1024] {
        let m = manager(SuspendPolicy::RetainOnSuspend);
        let a = m.create_session(SessionConfig::default()).unwrap();
        let handles: Vec<_> = (0..count)
            .map(|i| {
                m.register_resource(a, ResourceDescriptor::buffer(i as u64 * 256))
                    .unwrap()
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &handles, |bench, handles| {
            bench.iter(|| {
                for &handle in handles {
                    black_box(m.lookup_resource(handle).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ping_pong, bench_noop_switch, bench_resource_lookup);
criterion_main!(benches);
