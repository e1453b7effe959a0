use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::thread;

use bop_buffer::{BufferManager, BufferProvider, OriginId};
use bop_window::{
    KeyedThreadLocalSliceStore, MultiOriginWatermarkProcessor, SliceLifecycle, SliceMergeTask,
    SliceStoreConfig, WindowError,
};
use crossbeam::channel;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn read_count(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"))
}

/// Adds one record for `key` to the slice covering `ts`.
fn count(store: &mut KeyedThreadLocalSliceStore, ts: u64, key: u64) -> Result<(), WindowError> {
    let value = store
        .find_slice_by_ts(ts)?
        .state_mut()
        .find_or_insert_with(key, |_| {})?;
    let next = read_count(value) + 1;
    value[..8].copy_from_slice(&next.to_le_bytes());
    Ok(())
}

fn counts(state: &bop_window::ChainedHashMap) -> BTreeMap<u64, u64> {
    state.iter().map(|(key, value)| (key, read_count(value))).collect()
}

#[test]
fn watermark_closes_only_finished_slices() {
    init_tracing();
    let manager = BufferManager::with_capacity(4096, 8).expect("manager");
    let mut store =
        KeyedThreadLocalSliceStore::new(SliceStoreConfig::tumbling(10), Arc::new(manager.clone()))
            .expect("store");

    count(&mut store, 11, 1).expect("ts 11");
    count(&mut store, 12, 2).expect("ts 12");
    count(&mut store, 19, 1).expect("ts 19");
    assert_eq!(store.number_of_slices(), 1);
    {
        let a = store.get_slice(20).expect("slice A");
        assert_eq!((a.start(), a.end()), (10, 20));
        assert_eq!(a.state().len(), 2);
        assert_eq!(a.lifecycle(), SliceLifecycle::Accumulating);
    }

    count(&mut store, 21, 3).expect("ts 21");
    assert_eq!(store.number_of_slices(), 2);

    let evicted = store.set_last_watermark(20);
    assert_eq!(evicted.len(), 1);
    let a = &evicted[0];
    assert_eq!((a.start(), a.end()), (10, 20));
    assert_eq!(counts(a.state()), BTreeMap::from([(1, 2), (2, 1)]));

    assert_eq!(store.number_of_slices(), 1);
    let b = store.first_slice().expect("slice B");
    assert_eq!((b.start(), b.end()), (20, 30));

    assert!(matches!(
        count(&mut store, 19, 1),
        Err(WindowError::LateData {
            ts: 19,
            watermark: 20
        })
    ));
    drop(evicted);
    drop(store);
    assert_eq!(manager.outstanding_unpooled(), 0);
    assert_eq!(manager.shutdown(), Ok(()));
}

#[test]
fn sliding_windows_fill_finer_slices() {
    let manager = BufferManager::with_capacity(4096, 8).expect("manager");
    let mut store = KeyedThreadLocalSliceStore::new(
        SliceStoreConfig::sliding(10, 5),
        Arc::new(manager.clone()),
    )
    .expect("store");

    for ts in [1, 4, 6, 9, 11, 14] {
        count(&mut store, ts, 7).expect("record");
    }
    let ranges: Vec<(u64, u64)> = store.slices().map(|s| (s.start(), s.end())).collect();
    assert_eq!(ranges, vec![(0, 5), (5, 10), (10, 15)]);

    // Window [0, 10) is complete once both of its slices are evicted.
    let evicted = store.set_last_watermark(10);
    let window_total: u64 = evicted
        .iter()
        .map(|slice| counts(slice.state())[&7])
        .sum();
    assert_eq!(window_total, 4);
}

#[test]
fn closed_slices_move_to_a_merge_thread() {
    init_tracing();
    const WORKERS: u64 = 3;
    let manager = BufferManager::with_capacity(4096, 16).expect("manager");
    let (tx, rx) = channel::unbounded::<SliceMergeTask>();

    let merger = thread::spawn(move || {
        let mut windows: BTreeMap<(u64, u64), BTreeMap<u64, u64>> = BTreeMap::new();
        for task in rx {
            assert_eq!(task.slice.lifecycle(), SliceLifecycle::EligibleForEviction);
            let window = windows
                .entry((task.slice.start(), task.slice.end()))
                .or_default();
            for (key, count) in counts(task.slice.state()) {
                *window.entry(key).or_default() += count;
            }
        }
        windows
    });

    thread::scope(|scope| {
        for worker in 0..WORKERS {
            let tx = tx.clone();
            let provider: Arc<dyn BufferProvider> = Arc::new(manager.clone());
            scope.spawn(move || {
                let mut store =
                    KeyedThreadLocalSliceStore::new(SliceStoreConfig::tumbling(100), provider)
                        .expect("store");
                for ts in 0..300 {
                    count(&mut store, ts, ts % 4).expect("record");
                    if ts % 100 == 99 {
                        store.evict_into(ts - 99, &tx).expect("send");
                    }
                }
                let sent = store.evict_into(300, &tx).expect("send");
                assert!(sent >= 1);
                assert_eq!(store.number_of_slices(), 0);
                assert_eq!(store.metrics().slices_evicted, 3, "worker {worker}");
            });
        }
    });
    drop(tx);

    let windows = merger.join().expect("merger");
    assert_eq!(windows.len(), 3);
    for (range, keys) in &windows {
        assert_eq!(range.1 - range.0, 100);
        assert_eq!(keys.values().sum::<u64>(), 100 * WORKERS);
        assert_eq!(keys[&0], 25 * WORKERS);
    }
    assert_eq!(manager.outstanding_unpooled(), 0);
}

#[test]
fn merge_channel_closure_is_reported() {
    let manager = BufferManager::with_capacity(4096, 4).expect("manager");
    let mut store =
        KeyedThreadLocalSliceStore::new(SliceStoreConfig::tumbling(10), Arc::new(manager.clone()))
            .expect("store");
    count(&mut store, 5, 1).expect("record");
    let (tx, rx) = channel::bounded::<SliceMergeTask>(1);
    drop(rx);
    assert_eq!(
        store.evict_into(10, &tx),
        Err(WindowError::MergeChannelClosed)
    );
    assert_eq!(manager.outstanding_unpooled(), 0);
}

#[test]
fn buffers_drive_watermarks_and_slices() {
    init_tracing();
    let manager = BufferManager::with_capacity(256, 8).expect("manager");
    let origin = OriginId::new(1);
    let processor = MultiOriginWatermarkProcessor::new(&[origin]).expect("processor");
    let mut store =
        KeyedThreadLocalSliceStore::new(SliceStoreConfig::tumbling(10), Arc::new(manager.clone()))
            .expect("store");

    // Each buffer carries (ts, key) pairs and the watermark of its source.
    let batches: [(&[(u64, u64)], u64); 3] = [
        (&[(1, 1), (4, 2)], 4),
        (&[(12, 1), (15, 1)], 15),
        (&[(22, 3)], 22),
    ];
    let mut buffers = Vec::new();
    for (seq, (records, watermark)) in batches.iter().enumerate() {
        let mut buffer = manager.get_buffer_blocking().expect("buffer");
        let bytes = buffer.get_mut().expect("unique");
        for (i, (ts, key)) in records.iter().enumerate() {
            bytes[i * 16..i * 16 + 8].copy_from_slice(&ts.to_le_bytes());
            bytes[i * 16 + 8..i * 16 + 16].copy_from_slice(&key.to_le_bytes());
        }
        buffer.set_number_of_tuples(records.len() as u64);
        buffer.set_watermark(*watermark);
        buffer.set_sequence_number(seq as u64);
        buffer.set_origin_id(origin);
        buffers.push(buffer);
    }

    // Deliver out of order: the watermark waits for sequence 0.
    let mut evicted = Vec::new();
    for index in [1usize, 2, 0] {
        let buffer = &buffers[index];
        let bytes = buffer.as_slice();
        for i in 0..buffer.number_of_tuples() as usize {
            let ts = read_count(&bytes[i * 16..]);
            let key = read_count(&bytes[i * 16 + 8..]);
            count(&mut store, ts, key).expect("record");
        }
        let watermark = processor.update_from_buffer(buffer).expect("watermark");
        evicted.extend(store.set_last_watermark(watermark));
        if index != 0 {
            assert!(evicted.is_empty());
        }
    }

    assert_eq!(processor.current_watermark(), 22);
    let ranges: Vec<(u64, u64)> = evicted.iter().map(|s| (s.start(), s.end())).collect();
    assert_eq!(ranges, vec![(0, 10), (10, 20)]);
    assert_eq!(store.number_of_slices(), 1);
    drop(buffers);
    assert_eq!(manager.available_buffers(), 8);
}
