use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use warden_backend::InMemoryBackend;
use warden_core::{load_str, ConfigFormat, ObservedState};
use warden_engine::ReconciliationEngine;

fn configuration(connections: usize) -> String {
    let entries: Vec<String> = (0..connections)
        .map(|i| {
            format!(
                r#"{{"name": "conn-{i}", "auth": {{"type": "psk", "value": "k"}},
                    "encryption": {{"ike": "aes256-sha256-dh14", "esp": "aes256"}},
                    "local_subnets": ["10.{}.{}.0/24"], "remote_subnets": ["172.16.0.0/16"]}}"#,
                i / 256,
                i % 256
            )
        })
        .collect();
    format!(r#"{{"connections": [{}]}}"#, entries.join(","))
}

fn engine(connections: usize, backend: InMemoryBackend) -> ReconciliationEngine {
    let config = load_str(&configuration(connections), Some(ConfigFormat::Json)).unwrap();
    ReconciliationEngine::new(Arc::new(config), Arc::new(backend))
}

/// Steady-state heartbeat: probe only, no repair
fn benchmark_heartbeat(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = engine(1, InMemoryBackend::new());
    runtime.block_on(engine.apply());

    c.bench_function("heartbeat_poll", |b| {
        b.iter(|| runtime.block_on(black_box(&engine).poll_once()))
    });
}

/// Full repair cycle (probe, cleanup, apply, verify) by connection count
fn benchmark_repair_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("repair_cycle");

    for size in [1usize, 10, 100] {
        let backend = InMemoryBackend::new();
        let engine = engine(size, backend);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &engine, |b, engine| {
            b.iter(|| {
                runtime.block_on(async {
                    // An empty backend reports the link down.
                    engine.cleanup().await.unwrap();
                    engine.poll_once().await
                })
            })
        });
    }

    group.finish();
}

/// Concurrent health probes against a running engine
fn benchmark_concurrent_probes(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let backend = InMemoryBackend::new().with_observations([Ok(ObservedState::Connected)]);
    let engine = engine(4, backend);
    runtime.block_on(engine.apply());

    c.bench_function("concurrent_probes_8", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let probes: Vec<_> = (0..8)
                    .map(|_| {
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.probe().await })
                    })
                    .collect();
                for probe in probes {
                    black_box(probe.await.unwrap());
                }
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_heartbeat,
    benchmark_repair_cycle,
    benchmark_concurrent_probes
);
criterion_main!(benches);
