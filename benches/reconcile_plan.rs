//! Benchmarks for reconciliation planning and full passes

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use elasticsearch_operator::controlplane::Reconciler;
use elasticsearch_operator::{
    identify, ClusterController, ClusterKey, ClusterSpec, ControllerConfig, MemoryWorkloads,
    NodeGroup, NodeRole, ObservedState, ObservedWorkload, QuorumGuard, RoleSet, WorkloadTemplate,
};
use std::sync::Arc;

fn spec(groups: u32, replicas: u32) -> ClusterSpec {
    let key = ClusterKey::new("default", "bench");
    let data = RoleSet::from_roles([NodeRole::Data]);
    (0..groups).fold(
        ClusterSpec::new(key).with_group(NodeGroup::new(RoleSet::from_roles([NodeRole::Master]), 3)),
        |s, _| s.with_group(NodeGroup::new(data, replicas)),
    )
}

/// Observed state matching `spec` exactly, every workload ready
fn converged(spec: &ClusterSpec) -> ObservedState {
    spec.groups
        .iter()
        .enumerate()
        .flat_map(|(g, group)| {
            let revision = WorkloadTemplate::for_group(spec, group).revision();
            (1..=group.replicas).map(move |r| ObservedWorkload {
                identity: identify(&spec.key, g, r, group.roles),
                replicas: 1,
                ready_replicas: 1,
                revision: Some(revision.clone()),
            })
        })
        .collect()
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_plan");
    let reconciler = Reconciler::new(QuorumGuard::default());

    let desired = spec(10, 50);
    group.throughput(Throughput::Elements(desired.desired_workload_count() as u64));

    let empty = ObservedState::new();
    group.bench_function("plan_from_empty_503", |b| {
        b.iter(|| reconciler.plan(black_box(&desired), black_box(&empty)))
    });

    let observed = converged(&desired);
    group.bench_function("plan_fixed_point_503", |b| {
        b.iter(|| reconciler.plan(black_box(&desired), black_box(&observed)))
    });

    let scaled = spec(10, 60);
    group.bench_function("plan_scale_up_100", |b| {
        b.iter(|| reconciler.plan(black_box(&scaled), black_box(&observed)))
    });

    group.finish();
}

fn bench_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_pass");
    group.throughput(Throughput::Elements(1));

    let memory = Arc::new(MemoryWorkloads::new());
    let controller = ClusterController::new(ControllerConfig::default(), memory).unwrap();
    let desired = spec(4, 25);
    tokio_test::block_on(controller.reconcile(desired.clone())).unwrap();

    group.bench_function("converged_pass_103", |b| {
        b.iter(|| tokio_test::block_on(controller.reconcile(black_box(desired.clone()))))
    });

    group.finish();
}

criterion_group!(benches, bench_plan, bench_pass);
criterion_main!(benches);
