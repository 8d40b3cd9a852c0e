use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use devtree_core::{EndpointParams, Patch, Tree, TreeEvent};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn populated(devices: u32) -> Tree {
    let mut tree = Tree::new();
    for i in 0..devices {
        let ip = format!("fe80::{i:x}");
        tree.add_endpoint(&ip, 2, &EndpointParams::sensor(3, "power").with_device_name(format!("Plug {i}")))
            .unwrap();
        tree.add_endpoint(&ip, 1, &EndpointParams::actor(1, "relay")).unwrap();
    }
    tree
}

fn bench_loud_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("Tree Mutations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_value", |b| {
        let mut tree = populated(100);
        let sink = Arc::new(Mutex::new(0usize));
        let counter = sink.clone();
        tree.subscribe(move |_| *counter.lock().unwrap() += 1);

        let mut v = 0u64;
        b.iter(|| {
            v += 1;
            let patch = tree.record_value("fe80::2a.2", json!(v)).unwrap();
            black_box(patch);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Tree Mutations");
    group.throughput(Throughput::Elements(1));

    let mut source = populated(100);
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    source.subscribe(move |e: &TreeEvent| sink.lock().unwrap().push(e.patch().clone()));
    source.record_value("fe80::2a.2", json!(1234)).unwrap();
    let patch: Patch = captured.lock().unwrap().remove(0);

    group.bench_function("apply_update", |b| {
        let mut replica = populated(100);
        b.iter(|| {
            replica.apply_update(black_box(&patch)).unwrap();
        })
    });

    group.bench_function("hydrate_100_devices", |b| {
        let snapshot = source.snapshot();
        let mut replica = Tree::new();
        b.iter(|| {
            replica.hydrate(black_box(&snapshot)).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_loud_value, bench_apply_remote);
criterion_main!(benches);
