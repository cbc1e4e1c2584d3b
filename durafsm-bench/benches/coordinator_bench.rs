//! Persistence coordinator benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use durafsm_core::{MachineDefinition, When};
use durafsm_storage::{FileStore, MemoryStore, PersistenceCoordinator};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// Keeps instance IDs unique across iterations
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn counter_definition() -> Arc<MachineDefinition> {
    Arc::new(
        MachineDefinition::builder("counter")
            .state("running")
            .event("Tick")
            .initially(When::event("Tick").transition_to("running"))
            .during_any(When::event("Tick").then(|cx| {
                let count = cx.get("count").and_then(Value::as_u64).unwrap_or(0);
                cx.set("count", count + 1)
            }))
            .build()
            .unwrap(),
    )
}

fn bench_memory_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator_memory");
    let coordinator = PersistenceCoordinator::new(Arc::new(MemoryStore::new()), counter_definition());
    group.throughput(Throughput::Elements(1));

    group.bench_function("raise_new", |b| {
        b.iter(|| {
            let id = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
            black_box(
                coordinator
                    .raise(&format!("mem-{}", id), "Tick", &Value::Null)
                    .unwrap(),
            )
        });
    });

    group.bench_function("raise_existing", |b| {
        coordinator.raise("mem-hot", "Tick", &Value::Null).unwrap();
        b.iter(|| black_box(coordinator.raise("mem-hot", "Tick", &Value::Null).unwrap()));
    });

    group.bench_function("get", |b| {
        b.iter(|| black_box(coordinator.get("mem-hot").unwrap()));
    });

    group.finish();
}

fn bench_file_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator_file");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let coordinator = PersistenceCoordinator::new(store, counter_definition());
    group.throughput(Throughput::Elements(1));

    group.bench_function("raise_existing", |b| {
        coordinator.raise("file-hot", "Tick", &Value::Null).unwrap();
        b.iter(|| black_box(coordinator.raise("file-hot", "Tick", &Value::Null).unwrap()));
    });

    group.bench_function("get", |b| {
        b.iter(|| black_box(coordinator.get("file-hot").unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_memory_store, bench_file_store);

criterion_main!(benches);
