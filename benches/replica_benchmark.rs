use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cowrite::{ClientMessage, CrdtEvent, Replica};

fn sequential_typing_events(chars: usize) -> Vec<CrdtEvent> {
    let mut replica = Replica::new();
    let mut events = Vec::with_capacity(chars);
    for i in 0..chars {
        events.extend(replica.apply_local(i, i, "a", 1).unwrap());
    }
    events
}

fn bench_local_typing(c: &mut Criterion) {
    c.bench_function("apply_local_1k_sequential_chars", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for i in 0..1_000 {
                black_box(replica.apply_local(i, i, "a", 1).unwrap());
            }
        })
    });
}

fn bench_local_typing_at_head(c: &mut Criterion) {
    // Worst case for the position caches: every insert lands at offset 0.
    c.bench_function("apply_local_1k_chars_at_head", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for _ in 0..1_000 {
                black_box(replica.apply_local(0, 0, "a", 1).unwrap());
            }
        })
    });
}

fn bench_remote_integration(c: &mut Criterion) {
    let events = sequential_typing_events(1_000);
    c.bench_function("apply_remote_1k_events", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            black_box(replica.apply_remote(black_box(&events)).unwrap());
        })
    });
}

fn bench_duplicate_delivery(c: &mut Criterion) {
    let events = sequential_typing_events(1_000);
    let mut replica = Replica::new();
    replica.apply_remote(&events).unwrap();
    c.bench_function("apply_remote_1k_duplicates", |b| {
        b.iter(|| {
            black_box(replica.apply_remote(black_box(&events)).unwrap());
        })
    });
}

fn bench_materialize(c: &mut Criterion) {
    let events = sequential_typing_events(10_000);
    let replica = Replica::from_events(&events).unwrap();
    c.bench_function("materialize_10k_chars", |b| {
        b.iter(|| black_box(replica.text()))
    });
}

fn bench_compaction(c: &mut Criterion) {
    let mut replica = Replica::new();
    for i in 0..2_000 {
        replica.apply_local(i, i, "a", 1).unwrap();
    }
    replica.apply_local(0, 1_000, "", 1).unwrap();
    c.bench_function("compact_2k_entries_half_tombstoned", |b| {
        b.iter(|| black_box(replica.compacted()))
    });
}

fn bench_envelope_codec(c: &mut Criterion) {
    let events = sequential_typing_events(64);
    let message = ClientMessage::CrdtEvents { events };
    let encoded = message.encode().unwrap();

    c.bench_function("encode_64_event_batch", |b| {
        b.iter(|| black_box(message.encode().unwrap()))
    });
    c.bench_function("decode_64_event_batch", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_local_typing_at_head,
    bench_remote_integration,
    bench_duplicate_delivery,
    bench_materialize,
    bench_compaction,
    bench_envelope_codec,
);
criterion_main!(benches);
