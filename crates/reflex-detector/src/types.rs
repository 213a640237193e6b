//! Domain types for the hysteresis detector.
//!
//! Keys, transition kinds, raw kernel TCP states, thresholds and the
//! scaling signal emitted when a key's connection count stays out of
//! band for long enough.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};

// ── Keys ───────────────────────────────────────────────────────────

/// An independently monitored target: a network namespace inode or a
/// destination port.
///
/// Implemented for the unsigned integer widths the kernel hands out.
pub trait TrackedKey: Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl TrackedKey for u16 {}
impl TrackedKey for u32 {}
impl TrackedKey for u64 {}

// ── Transitions ────────────────────────────────────────────────────

/// How a socket state change affects the live connection count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// A connection became active.
    Established,
    /// A connection is going away.
    Closing,
    /// Any other state change; the count is untouched.
    Other,
}

/// Raw TCP states as numbered by the Linux kernel (`include/net/tcp_states.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpState {
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait1 = 4,
    FinWait2 = 5,
    TimeWait = 6,
    Close = 7,
    CloseWait = 8,
    LastAck = 9,
    Listen = 10,
    Closing = 11,
    NewSynRecv = 12,
}

impl TryFrom<u8> for TcpState {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => TcpState::Established,
            2 => TcpState::SynSent,
            3 => TcpState::SynRecv,
            4 => TcpState::FinWait1,
            5 => TcpState::FinWait2,
            6 => TcpState::TimeWait,
            7 => TcpState::Close,
            8 => TcpState::CloseWait,
            9 => TcpState::LastAck,
            10 => TcpState::Listen,
            11 => TcpState::Closing,
            12 => TcpState::NewSynRecv,
            other => return Err(other),
        })
    }
}

/// Which kernel states count as connection open / close.
///
/// The kernel hooks this models attach to different functions and
/// therefore see different states when a connection starts and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMapping {
    /// ESTABLISHED opens; CLOSE and CLOSE_WAIT close.
    #[default]
    EstablishedClose,
    /// FIN_WAIT1 opens; LAST_ACK closes (`tcp_rcv_state_process` view).
    FinWaitLastAck,
}

impl StateMapping {
    /// Classify a raw kernel state code. Unknown codes are `Other`.
    pub fn classify(self, code: u8) -> TransitionKind {
        let Ok(state) = TcpState::try_from(code) else {
            return TransitionKind::Other;
        };

        match (self, state) {
            (StateMapping::EstablishedClose, TcpState::Established) => TransitionKind::Established,
            (StateMapping::EstablishedClose, TcpState::Close | TcpState::CloseWait) => {
                TransitionKind::Closing
            }
            (StateMapping::FinWaitLastAck, TcpState::FinWait1) => TransitionKind::Established,
            (StateMapping::FinWaitLastAck, TcpState::LastAck) => TransitionKind::Closing,
            _ => TransitionKind::Other,
        }
    }
}

// ── Thresholds ─────────────────────────────────────────────────────

/// The normal connection-count band and the debounce length.
///
/// A count is out of band when `count <= lower_limit` or
/// `count >= upper_limit`; both boundaries are out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholds")]
pub struct Thresholds {
    lower_limit: u32,
    upper_limit: u32,
    buffer_length: u32,
}

#[derive(Deserialize)]
struct RawThresholds {
    lower_limit: u32,
    upper_limit: u32,
    buffer_length: u32,
}

impl TryFrom<RawThresholds> for Thresholds {
    type Error = DetectorError;

    fn try_from(raw: RawThresholds) -> DetectorResult<Self> {
        Thresholds::new(raw.lower_limit, raw.upper_limit, raw.buffer_length)
    }
}

impl Thresholds {
    /// Validate and build a threshold set.
    pub fn new(lower_limit: u32, upper_limit: u32, buffer_length: u32) -> DetectorResult<Self> {
        if lower_limit >= upper_limit {
            return Err(DetectorError::LimitsOutOfOrder {
                lower: lower_limit,
                upper: upper_limit,
            });
        }
        if buffer_length == 0 {
            return Err(DetectorError::ZeroBufferLength);
        }
        Ok(Self {
            lower_limit,
            upper_limit,
            buffer_length,
        })
    }

    pub fn lower_limit(&self) -> u32 {
        self.lower_limit
    }

    pub fn upper_limit(&self) -> u32 {
        self.upper_limit
    }

    pub fn buffer_length(&self) -> u32 {
        self.buffer_length
    }

    /// Where `count` sits relative to the band, or `None` when in band.
    pub fn excursion(&self, count: u32) -> Option<Direction> {
        if count <= self.lower_limit {
            Some(Direction::Lower)
        } else if count >= self.upper_limit {
            Some(Direction::Upper)
        } else {
            None
        }
    }
}

// ── Policy ─────────────────────────────────────────────────────────

/// What happens to a key after it fires a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebouncePolicy {
    /// Reset the buffer and keep evaluating. A sustained excursion fires
    /// again every `buffer_length` observations.
    #[default]
    AutoReset,
    /// Reset the buffer and latch the key as scaling. No evaluation
    /// happens until the latch is cleared or the key is re-registered.
    Latch,
}

// ── Signals ────────────────────────────────────────────────────────

/// Which side of the band a key left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Lower,
    Upper,
}

impl Direction {
    /// The scale direction understood by the scaling backend.
    pub fn scale_word(self) -> &'static str {
        match self {
            Direction::Lower => "under",
            Direction::Upper => "over",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Lower => f.write_str("Lower"),
            Direction::Upper => f.write_str("Upper"),
        }
    }
}

/// Emitted once a key has been out of band for `buffer_length`
/// consecutive observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingSignal<K> {
    pub key: K,
    pub direction: Direction,
    /// The count observed on the event that completed the buffer.
    pub triggering_count: u32,
    /// Latch set by this signal under `DebouncePolicy::Latch`; pass it to
    /// `HysteresisDetector::clear_latch` to re-arm exactly this latch.
    pub latch: Option<u64>,
}

/// Point-in-time view of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub count: u32,
    pub buffer: u32,
    pub scaling_active: bool,
}
