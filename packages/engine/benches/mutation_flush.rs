use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use replicant_engine::{
    boot, DeclareOpts, NoopTransport, Replicator, ReplicatorArgs, ReplicatorRole,
};
use serde_json::json;

fn seeded_replicator() -> (Replicator, Arc<replicant_engine::Replicant>) {
    let replicator = boot(ReplicatorArgs::new(
        ReplicatorRole::Authoritative,
        Arc::new(NoopTransport),
    ));
    let replicant = replicator
        .find_or_declare(
            "bench",
            "state",
            DeclareOpts {
                persistent: false,
                default_value: Some(json!({
                    "n": 0,
                    "xs": [1, 2, 3, 4, 5, 6, 7, 8],
                    "nested": {"a": {"b": {"c": 0}}}
                })),
                ..DeclareOpts::default()
            },
        )
        .expect("failed to declare benchmark replicant");
    (replicator, replicant)
}

fn bench_scalar_update_flush(c: &mut Criterion) {
    let (replicator, replicant) = seeded_replicator();
    let mut step: i64 = 0;

    c.bench_function("scalar_update_flush", |b| {
        b.iter(|| {
            step += 1;
            replicant.set("/n", json!(step)).expect("update should apply");
            replicator.flush_pending();
            black_box(replicant.revision());
        });
    });
}

fn bench_nested_update_flush(c: &mut Criterion) {
    let (replicator, replicant) = seeded_replicator();
    let mut step: i64 = 0;

    c.bench_function("nested_update_flush", |b| {
        b.iter(|| {
            step += 1;
            replicant
                .set("/nested/a/b/c", json!(step))
                .expect("nested update should apply");
            replicator.flush_pending();
            black_box(replicant.revision());
        });
    });
}

fn bench_sequence_mutators_flush(c: &mut Criterion) {
    let (replicator, replicant) = seeded_replicator();
    let xs = replicant
        .root()
        .expect("root handle")
        .at("xs")
        .expect("xs handle");
    let mut step: i64 = 0;

    c.bench_function("sequence_push_pop_flush", |b| {
        b.iter(|| {
            step += 1;
            xs.push([json!(step)]).expect("push should apply");
            xs.pop().expect("pop should apply");
            replicator.flush_pending();
            black_box(replicant.revision());
        });
    });
}

criterion_group!(
    benches,
    bench_scalar_update_flush,
    bench_nested_update_flush,
    bench_sequence_mutators_flush
);
criterion_main!(benches);
