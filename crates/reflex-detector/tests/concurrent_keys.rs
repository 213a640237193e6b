//! Concurrent delivery: many threads feeding distinct and shared keys.

use std::sync::{Arc, Mutex};
use std::thread;

use reflex_detector::{
    CallbackSink, DebouncePolicy, Direction, HysteresisDetector, ScalingSignal, Thresholds,
    TransitionKind,
};

#[test]
fn parallel_keys_keep_exact_counts() {
    let detector = Arc::new(HysteresisDetector::<u32>::new(
        Thresholds::new(1_000, 2_000, 10_000).unwrap(),
    ));
    for key in 0..8 {
        detector.register(key);
    }

    let handles: Vec<_> = (0..8u32)
        .map(|key| {
            let d = detector.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    d.on_state_transition(key, TransitionKind::Established);
                }
                for _ in 0..(key * 10) {
                    d.on_state_transition(key, TransitionKind::Closing);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let counts = detector.current_counts();
    for key in 0..8u32 {
        assert_eq!(counts[&key], 500 - key * 10);
    }
}

#[test]
fn shared_key_is_never_torn() {
    let detector = Arc::new(HysteresisDetector::<u32>::new(
        Thresholds::new(1_000, 2_000, 10_000).unwrap(),
    ));
    detector.register(42);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let d = detector.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    d.on_state_transition(42, TransitionKind::Established);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(detector.snapshot(42).unwrap().count, 4_000);
}

#[test]
fn latched_keys_signal_once_under_contention() {
    let fired: Arc<Mutex<Vec<ScalingSignal<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = fired.clone();

    let detector = Arc::new(
        HysteresisDetector::<u32>::new(Thresholds::new(3, 10, 5).unwrap())
            .with_policy(DebouncePolicy::Latch)
            .with_sink(CallbackSink::new(move |s: ScalingSignal<u32>| {
                sink_fired.lock().unwrap().push(s)
            })),
    );
    for key in [1, 2] {
        detector.register(key);
    }

    let handles: Vec<_> = (0..6u32)
        .map(|i| {
            let d = detector.clone();
            let key = i % 2 + 1;
            thread::spawn(move || {
                for _ in 0..50 {
                    d.on_state_transition(key, TransitionKind::Other);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut fired = fired.lock().unwrap().clone();
    fired.sort_by_key(|s| s.key);
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].key, 1);
    assert_eq!(fired[1].key, 2);
    assert!(fired.iter().all(|s| s.direction == Direction::Lower));
}
