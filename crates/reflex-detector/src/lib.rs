//! reflex-detector — debounced scaling signals from live TCP connection counts.
//!
//! Tracks active connections per key (a network namespace inode or a
//! destination port) from socket state transitions, and fires a
//! `ScalingSignal` once a key's count has sat outside the normal band
//! for `buffer_length` consecutive observations.
//!
//! # Architecture
//!
//! ```text
//! event source (kernel tracepoints, NDJSON, tests)
//!   │  on_state_transition(key, kind) / on_kernel_state(key, raw)
//!   ▼
//! HysteresisDetector<K>
//!   ├── per-key KeyState { count, buffer, scaling_active }
//!   ├── Thresholds { lower_limit, upper_limit, buffer_length }
//!   └── DebouncePolicy (AutoReset | Latch)
//!   │
//!   ▼
//! SignalSink (ChannelSink, CallbackSink, NullSink)
//! ```
//!
//! # Evaluation
//!
//! ```text
//! Established → count += 1
//! Closing     → count = max(0, count - 1)
//! if scaling_active: stop
//! if count <= lower_limit or count >= upper_limit: buffer += 1
//! else: buffer = 0
//! if buffer == buffer_length:
//!     fire Lower (count <= lower_limit) or Upper
//!     buffer = 0
//!     Latch policy: scaling_active = true
//! ```
//!
//! `AutoReset` (the default) keeps firing every `buffer_length`
//! observations while the excursion lasts. `Latch` fires once and waits
//! for `clear_scaling()` or re-registration.

pub mod config;
pub mod detector;
pub mod error;
pub mod sink;
pub mod types;

pub use config::{parse_duration, KeyKind, ReflexConfig};
pub use detector::HysteresisDetector;
pub use error::{DetectorError, DetectorResult};
pub use sink::{CallbackSink, ChannelSink, NullSink, SignalSink};
pub use types::*;
