use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use bop_buffer::OriginId;
use bop_window::{MultiOriginWatermarkProcessor, SequencerConfig, WatermarkSequencer};
use proptest::prelude::*;
use rand::seq::SliceRandom;

fn permutation(max: u64) -> impl Strategy<Value = Vec<u64>> {
    (0..max).prop_flat_map(|k| Just((0..=k).collect::<Vec<u64>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn any_permutation_converges_to_the_last_number(order in permutation(3_000)) {
        let last = order.len() as u64 - 1;
        let sequencer = WatermarkSequencer::new();
        let mut previous = 0;
        for seq in order {
            let current = sequencer.update(seq, seq);
            prop_assert!(current >= previous);
            previous = current;
        }
        prop_assert_eq!(sequencer.current(), last);
        prop_assert_eq!(sequencer.current_sequence(), Some(last));
    }

    #[test]
    fn a_missing_number_stalls_progress(order in permutation(2_500), pick in any::<prop::sample::Index>()) {
        let missing = order[pick.index(order.len())];
        let sequencer = WatermarkSequencer::new();
        for seq in order.into_iter().filter(|seq| *seq != missing) {
            sequencer.update(seq, seq);
        }
        prop_assert_eq!(sequencer.current(), missing.saturating_sub(1));
        prop_assert_eq!(sequencer.current_sequence(), missing.checked_sub(1));
    }
}

#[test]
fn concurrent_writers_converge() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 20_000;
    let total = THREADS * PER_THREAD;

    let mut order: Vec<u64> = (1..=total).collect();
    order.shuffle(&mut rand::rng());
    let sequencer = WatermarkSequencer::with_config(SequencerConfig::starting_at(1));
    let next = AtomicU64::new(0);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= total {
                        break;
                    }
                    let seq = order[i as usize];
                    let before = sequencer.current();
                    let after = sequencer.update(seq, seq * 10);
                    assert!(after >= before);
                }
            });
        }
    });

    assert_eq!(sequencer.current(), total * 10);
    assert_eq!(sequencer.current_sequence(), Some(total));
}

#[test]
fn concurrent_origins_report_the_slowest() {
    const UPDATES: u64 = 10_000;
    let origins: Vec<OriginId> = (1..=4).map(OriginId::new).collect();
    let processor = MultiOriginWatermarkProcessor::with_config(
        &origins,
        SequencerConfig::starting_at(1),
    )
    .expect("processor");

    thread::scope(|scope| {
        for (i, origin) in origins.iter().enumerate() {
            let processor = &processor;
            let origin = *origin;
            scope.spawn(move || {
                // Each origin advances its watermark at a different rate.
                let step = i as u64 + 1;
                for seq in 1..=UPDATES {
                    processor
                        .update_watermark(seq * step, seq, origin)
                        .expect("known origin");
                }
            });
        }
    });

    assert_eq!(processor.current_watermark(), UPDATES);
    assert_eq!(processor.origin_watermark(origins[3]), Ok(UPDATES * 4));
}
