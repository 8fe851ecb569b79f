use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cdmf::concurrency::WorkerPool;
use cdmf::event::{Event, EventBus};
use cdmf::security::{Permission, PermissionManager, PermissionType};
use cdmf::service::SERVICE_RANKING;
use cdmf::{Properties, ServiceRegistry};

fn benchmark_pool_throughput(c: &mut Criterion) {
    let pool = WorkerPool::new(4);

    c.bench_function("pool_execute_1000_jobs", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..1000 {
                let counter = counter.clone();
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
            pool.wait();
            black_box(counter.load(Ordering::Relaxed));
        })
    });
}

fn benchmark_registry_lookup(c: &mut Criterion) {
    let registry = ServiceRegistry::new();
    for i in 0..200i64 {
        registry
            .register_service(
                "bench",
                "IStore",
                i,
                Properties::new()
                    .with(SERVICE_RANKING, i % 7)
                    .with("shard", format!("s{}", i % 10)),
            )
            .unwrap();
    }

    c.bench_function("registry_best_of_200", |b| {
        b.iter(|| black_box(registry.get_service_reference("IStore", None).unwrap()))
    });
    c.bench_function("registry_filtered_200", |b| {
        b.iter(|| {
            black_box(
                registry
                    .get_service_references("IStore", Some("(&(shard=s3)(service.ranking=*))"))
                    .unwrap(),
            )
        })
    });
}

fn benchmark_permission_check(c: &mut Criterion) {
    let manager = PermissionManager::new();
    for i in 0..50 {
        manager
            .grant(
                "bench",
                Permission::grant(PermissionType::ServiceGet, format!("com.example.s{}.*", i)),
            )
            .unwrap();
    }
    manager
        .grant("bench", Permission::deny(PermissionType::ServiceGet, "com.example.s7.secret"))
        .unwrap();

    c.bench_function("permission_check_50_entries", |b| {
        b.iter(|| {
            black_box(manager.check(
                "bench",
                PermissionType::ServiceGet,
                black_box("com.example.s42.Store"),
            ))
        })
    });
}

fn benchmark_event_publish(c: &mut Criterion) {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    for i in 0..20 {
        let hits = hits.clone();
        bus.subscribe("bench", &format!("app/topic{}/*", i), move |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    let event = Event::new("app/topic3/changed").with_property("n", 1i64);

    c.bench_function("event_publish_20_subscribers", |b| {
        b.iter(|| black_box(bus.publish(&event)))
    });
}

criterion_group!(
    benches,
    benchmark_pool_throughput,
    benchmark_registry_lookup,
    benchmark_permission_check,
    benchmark_event_publish
);
criterion_main!(benches);
