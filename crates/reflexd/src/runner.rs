//! Daemon run loop.
//!
//! Wires an event stream into a `HysteresisDetector` and runs two
//! background tasks next to it:
//!
//! ```text
//! input lines ──► parse_line() ──► detector ──► ChannelSink
//!                                     │              │
//!                                     │              ▼
//!                                     │        signal consumer
//!                                     │          └── re-arm after `rearm_after` (Latch)
//!                                     ▼
//!                               count reporter (every `report_interval`)
//! ```
//!
//! The loop ends at end of input or on Ctrl-C; both background tasks
//! stop through a shared watch channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use reflex_detector::{
    ChannelSink, HysteresisDetector, ReflexConfig, ScalingSignal, TrackedKey,
};

use crate::events::{parse_line, EventAction};

/// Timing knobs for the background tasks.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub rearm_after: Duration,
    pub report_interval: Duration,
}

impl RunSettings {
    pub fn from_config(config: &ReflexConfig) -> anyhow::Result<Self> {
        Ok(Self {
            rearm_after: config.daemon.rearm_after()?,
            report_interval: config.daemon.report_interval()?,
        })
    }
}

/// What happened during one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary<K> {
    /// Lines applied to the detector.
    pub events: u64,
    /// Lines rejected as malformed or with out-of-range keys.
    pub rejected: u64,
    /// Signals handled by the consumer, in delivery order.
    pub signals: Vec<ScalingSignal<K>>,
    /// Connection counts at shutdown.
    pub final_counts: BTreeMap<K, u32>,
}

/// Run the detector over `input` until end of input or Ctrl-C.
///
/// `keys` are registered before the first line is read.
pub async fn run<K, R>(
    config: &ReflexConfig,
    settings: RunSettings,
    keys: &[K],
    input: R,
) -> anyhow::Result<RunSummary<K>>
where
    K: TrackedKey + TryFrom<u32>,
    R: AsyncBufRead + Unpin,
{
    let (sink, signal_rx) = ChannelSink::new();
    let detector = Arc::new(config.build_detector::<K>().with_sink(sink));

    for &key in keys {
        detector.register(key);
    }
    info!(
        keys = keys.len(),
        lower = config.thresholds.lower_limit(),
        upper = config.thresholds.upper_limit(),
        buffer = config.thresholds.buffer_length(),
        policy = ?detector.policy(),
        "detector ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = tokio::spawn(consume_signals(
        detector.clone(),
        signal_rx,
        settings.rearm_after,
        shutdown_rx.clone(),
    ));
    let reporter = spawn_reporter(detector.clone(), settings.report_interval, shutdown_rx);

    let (events, rejected) = feed(&detector, input, interrupted()).await?;

    let _ = shutdown_tx.send(true);
    let signals = consumer.await?;
    let _ = reporter.await;

    let final_counts = detector.current_counts();
    info!(events, rejected, signals = signals.len(), "reflexd stopped");

    Ok(RunSummary {
        events,
        rejected,
        signals,
        final_counts,
    })
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Apply every line of `input` to the detector until end of input or
/// until `interrupt` resolves. A pending interrupt wins over a ready line.
///
/// Returns `(applied, rejected)` line counts.
async fn feed<K, R, F>(
    detector: &HysteresisDetector<K>,
    input: R,
    interrupt: F,
) -> anyhow::Result<(u64, u64)>
where
    K: TrackedKey + TryFrom<u32>,
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut applied = 0u64;
    let mut rejected = 0u64;
    let mut line_no = 0u64;
    tokio::pin!(interrupt);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut interrupt => break,
            next = lines.next_line() => next?,
        };
        let Some(line) = next else {
            break;
        };
        line_no += 1;

        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping event");
                rejected += 1;
                continue;
            }
        };

        let Ok(key) = K::try_from(event.key) else {
            warn!(line = line_no, key = event.key, "key out of range, skipping event");
            rejected += 1;
            continue;
        };

        match event.action {
            EventAction::Raw(code) => detector.on_kernel_state(key, code),
            EventAction::Kind(kind) => detector.on_state_transition(key, kind),
        };
        applied += 1;
    }

    debug!(lines = line_no, applied, rejected, "end of input");
    Ok((applied, rejected))
}

/// Log each signal and, under `Latch`, re-arm the key after `rearm_after`.
///
/// Drains anything still queued once shutdown is requested, then
/// returns every signal seen.
async fn consume_signals<K: TrackedKey>(
    detector: Arc<HysteresisDetector<K>>,
    mut rx: mpsc::UnboundedReceiver<ScalingSignal<K>>,
    rearm_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<ScalingSignal<K>> {
    let mut seen = Vec::new();

    loop {
        tokio::select! {
            biased;
            Some(signal) = rx.recv() => {
                handle_signal(&detector, signal, rearm_after);
                seen.push(signal);
            }
            _ = shutdown.changed() => break,
        }
    }

    while let Ok(signal) = rx.try_recv() {
        handle_signal(&detector, signal, rearm_after);
        seen.push(signal);
    }

    seen
}

fn handle_signal<K: TrackedKey>(
    detector: &Arc<HysteresisDetector<K>>,
    signal: ScalingSignal<K>,
    rearm_after: Duration,
) {
    info!(
        key = %signal.key,
        direction = %signal.direction,
        scale = signal.direction.scale_word(),
        count = signal.triggering_count,
        "scale triggered"
    );

    let Some(latch) = signal.latch else {
        return;
    };

    // Only the latch this signal set is cleared; a key that was
    // re-registered and latched again in the meantime keeps its new latch.
    let detector = detector.clone();
    let key = signal.key;
    tokio::spawn(async move {
        tokio::time::sleep(rearm_after).await;
        if detector.clear_latch(key, latch) {
            debug!(%key, latch, "key re-armed");
        }
    });
}

fn spawn_reporter<K: TrackedKey>(
    detector: Arc<HysteresisDetector<K>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    for (key, snap) in detector.snapshot_all() {
                        info!(
                            %key,
                            connections = snap.count,
                            buffer = snap.buffer,
                            scaling = snap.scaling_active,
                            "active connections"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
