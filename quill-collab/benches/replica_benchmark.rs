use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::bus::{BusEnvelope, Replicated};
use quill_collab::diff::text_edit;
use quill_collab::replica::{Lineage, Operation, Replica, ReplicaId, ReplicaState};
use quill_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use quill_collab::DocumentId;

fn typed(replica: &mut Replica, text: &str) -> Vec<Operation> {
    text.chars()
        .map(|c| {
            let len = replica.len();
            replica.insert_local(len, c)
        })
        .collect()
}

fn sample_text(len: usize) -> String {
    "the quick brown fox jumps over the lazy dog "
        .chars()
        .cycle()
        .take(len)
        .collect()
}

// ─── Replica benchmarks ─────────────────────────────────────

fn bench_type_1000_chars(c: &mut Criterion) {
    let text = sample_text(1000);
    c.bench_function("replica_type_1000_chars", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaId(1));
            black_box(typed(&mut replica, black_box(&text)));
        })
    });
}

fn bench_apply_remote_1000_ops(c: &mut Criterion) {
    let mut source = Replica::new(ReplicaId(1));
    let ops = typed(&mut source, &sample_text(1000));

    c.bench_function("replica_apply_1000_remote_ops", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaId(2));
            black_box(replica.apply_all(black_box(&ops)));
        })
    });
}

fn bench_apply_reversed_1000_ops(c: &mut Criterion) {
    let mut source = Replica::new(ReplicaId(1));
    let mut ops = typed(&mut source, &sample_text(1000));
    ops.reverse();

    c.bench_function("replica_apply_1000_reversed_ops", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaId(2));
            black_box(replica.apply_all(black_box(&ops)));
        })
    });
}

fn bench_load_10k(c: &mut Criterion) {
    let text = sample_text(10_000);
    c.bench_function("replica_load_10k_chars", |b| {
        b.iter(|| {
            black_box(Replica::hydrated(ReplicaId(1), black_box(&text), Lineage::ORIGIN));
        })
    });
}

fn bench_materialize_10k(c: &mut Criterion) {
    let replica = Replica::hydrated(ReplicaId(1), &sample_text(10_000), Lineage::ORIGIN);
    c.bench_function("replica_materialize_10k_chars", |b| {
        b.iter(|| black_box(replica.materialize()))
    });
}

fn bench_text_edit_middle_10k(c: &mut Criterion) {
    let old = sample_text(10_000);
    let mut new = old.clone();
    new.insert_str(5_000, "inserted ");
    let base = Replica::hydrated(ReplicaId(1), &old, Lineage::ORIGIN);

    c.bench_function("replica_text_edit_middle_10k", |b| {
        b.iter(|| {
            let mut replica = base.clone();
            let edit = text_edit(black_box(&old), black_box(&new));
            black_box(replica.apply_text_edit(&edit));
        })
    });
}

fn bench_paste_middle_10k(c: &mut Criterion) {
    let old = sample_text(10_000);
    let mut new = old.clone();
    new.insert_str(5_000, &sample_text(1_000));
    let base = Replica::hydrated(ReplicaId(1), &old, Lineage::ORIGIN);

    c.bench_function("replica_paste_1000_chars_middle_10k", |b| {
        b.iter(|| {
            let mut replica = base.clone();
            let edit = text_edit(black_box(&old), black_box(&new));
            black_box(replica.apply_text_edit(&edit));
        })
    });
}

// ─── Bus benchmarks ─────────────────────────────────────────

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let mut source = Replica::new(ReplicaId(1));
    let ops = typed(&mut source, &sample_text(64));
    let envelope = BusEnvelope::new(DocumentId::from("bench"), Replicated::Edit { lineage: Lineage::ORIGIN, ops });

    c.bench_function("envelope_roundtrip_64_ops", |b| {
        b.iter(|| {
            let bytes = envelope.encode().unwrap();
            black_box(BusEnvelope::decode(black_box(&bytes)).unwrap());
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_store_save_4kb(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc = DocumentId::from("bench");
    let content = sample_text(4096);
    let state = ReplicaState::default();

    c.bench_function("store_save_4KB", |b| {
        b.iter(|| runtime.block_on(async { black_box(store.save(&doc, &content, &state).await.unwrap()) }))
    });
}

fn bench_store_hydrate_4kb(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc = DocumentId::from("bench");
    runtime.block_on(store.save(&doc, &sample_text(4096), &ReplicaState::default())).unwrap();

    c.bench_function("store_get_or_create_4KB", |b| {
        b.iter(|| runtime.block_on(async { black_box(store.get_or_create(&doc).await.unwrap()) }))
    });
}

criterion_group!(
    benches,
    bench_type_1000_chars,
    bench_apply_remote_1000_ops,
    bench_apply_reversed_1000_ops,
    bench_load_10k,
    bench_materialize_10k,
    bench_text_edit_middle_10k,
    bench_paste_middle_10k,
    bench_envelope_roundtrip,
    bench_store_save_4kb,
    bench_store_hydrate_4kb,
);
criterion_main!(benches);
