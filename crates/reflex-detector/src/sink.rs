//! Delivery of scaling signals to whoever acts on them.
//!
//! The detector pushes every signal it fires into a `SignalSink`. Sinks
//! are called outside the per-key lock and must not block.

use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ScalingSignal, TrackedKey};

/// Receives scaling signals as they fire.
pub trait SignalSink<K>: Send + Sync {
    fn deliver(&self, signal: ScalingSignal<K>);
}

/// Drops every signal. Callers still see signals as return values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl<K> SignalSink<K> for NullSink {
    fn deliver(&self, _signal: ScalingSignal<K>) {}
}

/// Forwards signals into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink<K> {
    tx: mpsc::UnboundedSender<ScalingSignal<K>>,
}

impl<K> ChannelSink<K> {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScalingSignal<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<ScalingSignal<K>>) -> Self {
        Self { tx }
    }
}

impl<K: TrackedKey> SignalSink<K> for ChannelSink<K> {
    fn deliver(&self, signal: ScalingSignal<K>) {
        if let Err(e) = self.tx.send(signal) {
            let lost = e.0;
            warn!(
                key = %lost.key,
                direction = %lost.direction,
                "signal receiver closed, dropping scaling signal"
            );
        }
    }
}

/// Invokes a closure for every signal.
pub struct CallbackSink<F> {
    f: F,
}

impl<F> CallbackSink<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<K, F> SignalSink<K> for CallbackSink<F>
where
    F: Fn(ScalingSignal<K>) + Send + Sync,
{
    fn deliver(&self, signal: ScalingSignal<K>) {
        (self.f)(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::sync::Mutex;

    fn signal(key: u32) -> ScalingSignal<u32> {
        ScalingSignal {
            key,
            direction: Direction::Upper,
            triggering_count: 12,
            latch: None,
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.deliver(signal(7));
        assert_eq!(rx.recv().await, Some(signal(7)));
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::<u32>::new();
        drop(rx);
        sink.deliver(signal(1));
    }

    #[test]
    fn callback_sink_invokes_closure() {
        let seen = Mutex::new(Vec::new());
        let sink = CallbackSink::new(|s: ScalingSignal<u32>| seen.lock().unwrap().push(s.key));
        sink.deliver(signal(3));
        sink.deliver(signal(4));
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
    }
}
