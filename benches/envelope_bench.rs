//! Envelope encode/decode benchmarks.
//!
//! Encoding and decoding run on every publish and every fetched message —
//! the one hot path shared by the producer and the consumer. Run with
//! `cargo bench`.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use jetstream_bridge::Envelope;
use serde_json::json;

fn small_payload() -> serde_json::Value {
    json!({"id": 1, "name": "Ada"})
}

fn large_payload() -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    for i in 0..100 {
        fields.insert(format!("field_{i}"), json!(format!("value-{i}")));
    }
    serde_json::Value::Object(fields)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");

    let small = Envelope::new("api", "user.created", "user", "42", small_payload(), None, None);
    group.throughput(Throughput::Elements(1));
    group.bench_function("small_payload", |b| {
        b.iter(|| black_box(small.encode().unwrap()))
    });

    let large = Envelope::new("api", "user.updated", "user", "42", large_payload(), None, None);
    group.bench_function("large_payload", |b| {
        b.iter(|| black_box(large.encode().unwrap()))
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");

    let small = Envelope::new("api", "user.created", "user", "42", small_payload(), None, None);
    let small_bytes = small.encode().unwrap();
    group.throughput(Throughput::Elements(1));
    group.bench_function("small_payload", |b| {
        b.iter(|| black_box(Envelope::decode(&small_bytes).unwrap()))
    });

    let large = Envelope::new("api", "user.updated", "user", "42", large_payload(), None, None);
    let large_bytes = large.encode().unwrap();
    group.bench_function("large_payload", |b| {
        b.iter(|| black_box(Envelope::decode(&large_bytes).unwrap()))
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    c.bench_function("envelope_round_trip", |b| {
        b.iter(|| {
            let env = Envelope::new("api", "user.created", "user", "42", small_payload(), None, None);
            let bytes = env.encode().unwrap();
            black_box(Envelope::decode(&bytes).unwrap())
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_round_trip);
criterion_main!(benches);
