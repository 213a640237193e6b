//! Hysteresis detector — per-key connection counts with a debounce buffer.
//!
//! Each registered key carries a live connection count, a buffer of
//! consecutive out-of-band observations and a scaling-active latch.
//! Every state transition updates the count and then runs the buffer
//! evaluation; once the buffer reaches `buffer_length` a
//! `ScalingSignal` fires.
//!
//! Events for one key are applied under that key's mutex. The key map
//! sits behind an `RwLock`: events share the read side, so different
//! keys proceed in parallel, while register / unregister take the write
//! side and wait for in-flight events to finish.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace};

use crate::sink::{NullSink, SignalSink};
use crate::types::*;

/// Mutable state for one tracked key.
#[derive(Debug, Default)]
struct KeyState {
    /// Live connections.
    count: u32,
    /// Consecutive out-of-band observations.
    buffer: u32,
    /// Id of the latch set by the last signal under `DebouncePolicy::Latch`.
    latch: Option<u64>,
}

impl KeyState {
    fn snapshot(&self) -> KeySnapshot {
        KeySnapshot {
            count: self.count,
            buffer: self.buffer,
            scaling_active: self.latch.is_some(),
        }
    }
}

/// Debounces connection-count excursions into scaling signals.
pub struct HysteresisDetector<K: TrackedKey> {
    thresholds: Thresholds,
    policy: DebouncePolicy,
    mapping: StateMapping,
    /// Registered keys: key → state.
    keys: RwLock<HashMap<K, Mutex<KeyState>>>,
    sink: Box<dyn SignalSink<K>>,
    /// Source of latch ids; unique for the detector's lifetime.
    next_latch: AtomicU64,
}

impl<K: TrackedKey> HysteresisDetector<K> {
    /// Create a detector with the default `AutoReset` policy, the
    /// ESTABLISHED/CLOSE state mapping and no sink.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            policy: DebouncePolicy::default(),
            mapping: StateMapping::default(),
            keys: RwLock::new(HashMap::new()),
            sink: Box::new(NullSink),
            next_latch: AtomicU64::new(1),
        }
    }

    /// Set the post-signal policy.
    pub fn with_policy(mut self, policy: DebouncePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how raw kernel states are classified.
    pub fn with_state_mapping(mut self, mapping: StateMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Set the sink that receives fired signals.
    pub fn with_sink(mut self, sink: impl SignalSink<K> + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn policy(&self) -> DebouncePolicy {
        self.policy
    }

    pub fn state_mapping(&self) -> StateMapping {
        self.mapping
    }

    /// Start tracking `key` with zero count, empty buffer and no latch.
    ///
    /// Re-registering an existing key resets it.
    pub fn register(&self, key: K) {
        let mut keys = self.write_keys();
        let previous = keys.insert(key, Mutex::new(KeyState::default()));
        debug!(%key, reset = previous.is_some(), "key registered");
    }

    /// Stop tracking `key`. Returns whether it was registered.
    pub fn unregister(&self, key: K) -> bool {
        let removed = self.write_keys().remove(&key).is_some();
        if removed {
            debug!(%key, "key unregistered");
        }
        removed
    }

    pub fn is_registered(&self, key: K) -> bool {
        self.read_keys().contains_key(&key)
    }

    /// Clear the scaling latch and buffer for `key` so evaluation resumes.
    ///
    /// Returns whether the key is registered.
    pub fn clear_scaling(&self, key: K) -> bool {
        let keys = self.read_keys();
        let Some(slot) = keys.get(&key) else {
            return false;
        };
        let mut state = lock(slot);
        state.latch = None;
        state.buffer = 0;
        debug!(%key, count = state.count, "scaling latch cleared");
        true
    }

    /// Clear the latch on `key` only if it is still the one identified by
    /// `latch` (from `ScalingSignal::latch`).
    ///
    /// A key that was re-registered, or latched again, since that signal
    /// fired is left alone. Returns whether the latch was cleared.
    pub fn clear_latch(&self, key: K, latch: u64) -> bool {
        let keys = self.read_keys();
        let Some(slot) = keys.get(&key) else {
            return false;
        };
        let mut state = lock(slot);
        if state.latch != Some(latch) {
            trace!(%key, latch, current = ?state.latch, "stale latch, not cleared");
            return false;
        }
        state.latch = None;
        state.buffer = 0;
        debug!(%key, latch, count = state.count, "scaling latch cleared");
        true
    }

    /// Classify a raw kernel TCP state and apply it to `key`.
    pub fn on_kernel_state(&self, key: K, raw_state: u8) -> Option<ScalingSignal<K>> {
        let kind = self.mapping.classify(raw_state);
        trace!(%key, raw_state, ?kind, "kernel state observed");
        self.on_state_transition(key, kind)
    }

    /// Apply one state transition to `key` and run the buffer evaluation.
    ///
    /// Returns the signal if this event completed the buffer. The same
    /// signal is pushed to the configured sink.
    pub fn on_state_transition(&self, key: K, kind: TransitionKind) -> Option<ScalingSignal<K>> {
        let signal = {
            let keys = self.read_keys();
            let Some(slot) = keys.get(&key) else {
                trace!(%key, "event for unregistered key ignored");
                return None;
            };
            let mut state = lock(slot);
            self.apply(key, &mut state, kind)
        };

        if let Some(signal) = signal {
            info!(
                key = %signal.key,
                direction = %signal.direction,
                count = signal.triggering_count,
                "scaling signal fired"
            );
            self.sink.deliver(signal);
        }

        signal
    }

    /// Count update followed by the buffer evaluation.
    fn apply(&self, key: K, state: &mut KeyState, kind: TransitionKind) -> Option<ScalingSignal<K>> {
        match kind {
            TransitionKind::Established => state.count = state.count.saturating_add(1),
            TransitionKind::Closing => state.count = state.count.saturating_sub(1),
            TransitionKind::Other => {}
        }

        if state.latch.is_some() {
            return None;
        }

        let count = state.count;
        let Some(direction) = self.thresholds.excursion(count) else {
            if state.buffer > 0 {
                trace!(%key, count, "count back in band, buffer reset");
            }
            state.buffer = 0;
            return None;
        };

        state.buffer += 1;
        trace!(%key, count, buffer = state.buffer, %direction, "count out of band");

        if state.buffer < self.thresholds.buffer_length() {
            return None;
        }

        state.buffer = 0;
        let latch = match self.policy {
            DebouncePolicy::Latch => {
                let id = self.next_latch.fetch_add(1, Ordering::Relaxed);
                state.latch = Some(id);
                Some(id)
            }
            DebouncePolicy::AutoReset => None,
        };

        Some(ScalingSignal {
            key,
            direction,
            triggering_count: count,
            latch,
        })
    }

    /// State of a single key, if registered.
    pub fn snapshot(&self, key: K) -> Option<KeySnapshot> {
        self.read_keys().get(&key).map(|slot| lock(slot).snapshot())
    }

    /// Live connection count of every registered key.
    pub fn current_counts(&self) -> BTreeMap<K, u32> {
        self.read_keys()
            .iter()
            .map(|(key, slot)| (*key, lock(slot).count))
            .collect()
    }

    /// Full state of every registered key.
    pub fn snapshot_all(&self) -> BTreeMap<K, KeySnapshot> {
        self.read_keys()
            .iter()
            .map(|(key, slot)| (*key, lock(slot).snapshot()))
            .collect()
    }

    /// Registered keys in ascending order.
    pub fn tracked_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.read_keys().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, HashMap<K, Mutex<KeyState>>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, HashMap<K, Mutex<KeyState>>> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// Per-key state is plain integers, so a poisoned lock still holds a
// usable value.
fn lock(slot: &Mutex<KeyState>) -> MutexGuard<'_, KeyState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: TrackedKey> std::fmt::Debug for HysteresisDetector<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HysteresisDetector")
            .field("thresholds", &self.thresholds)
            .field("policy", &self.policy)
            .field("mapping", &self.mapping)
            .field("keys", &self.read_keys().len())
            .finish_non_exhaustive()
    }
}
