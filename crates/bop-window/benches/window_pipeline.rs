use std::sync::Arc;

use bop_buffer::BufferManager;
use bop_window::{KeyedThreadLocalSliceStore, SliceStoreConfig, WatermarkSequencer};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_sequencer_in_order(c: &mut Criterion) {
    c.bench_function("sequencer_in_order_update", |b| {
        let sequencer = WatermarkSequencer::new();
        let mut seq = 0u64;
        b.iter(|| {
            black_box(sequencer.update(seq, seq));
            seq += 1;
        });
    });
}

fn bench_slice_store_records(c: &mut Criterion) {
    let manager = BufferManager::with_capacity(4096, 64).unwrap();
    c.bench_function("slice_store_record_and_evict", |b| {
        b.iter(|| {
            let mut store = KeyedThreadLocalSliceStore::new(
                SliceStoreConfig::tumbling(100),
                Arc::new(manager.clone()),
            )
            .unwrap();
            for ts in 0..1_000u64 {
                let value = store
                    .find_slice_by_ts(ts)
                    .unwrap()
                    .state_mut()
                    .find_or_insert_with(ts % 32, |_| {})
                    .unwrap();
                value[0] = value[0].wrapping_add(1);
            }
            black_box(store.set_last_watermark(1_000).len());
        });
    });
}

criterion_group!(benches, bench_sequencer_in_order, bench_slice_store_records);
criterion_main!(benches);
