//! Newline-delimited JSON event input.
//!
//! Each line describes one socket state transition:
//!
//! ```text
//! {"key": 4026532281, "state": 1}           raw kernel TCP state
//! {"key": 8080, "kind": "closing"}          pre-classified transition
//! ```

use serde::Deserialize;
use thiserror::Error;

use reflex_detector::TransitionKind;

/// What an event line asks the detector to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Classify through the detector's state mapping.
    Raw(u8),
    Kind(TransitionKind),
}

/// Why an input line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Json(String),

    #[error("event has both `state` and `kind`")]
    Ambiguous,

    #[error("event has neither `state` nor `kind`")]
    MissingTransition,
}

/// One parsed event, key still at wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub key: u32,
    pub action: EventAction,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EventLine {
    key: u32,
    state: Option<u8>,
    kind: Option<TransitionKind>,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Event>, EventError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let raw: EventLine =
        serde_json::from_str(line).map_err(|e| EventError::Json(e.to_string()))?;

    let action = match (raw.state, raw.kind) {
        (Some(code), None) => EventAction::Raw(code),
        (None, Some(kind)) => EventAction::Kind(kind),
        (Some(_), Some(_)) => return Err(EventError::Ambiguous),
        (None, None) => return Err(EventError::MissingTransition),
    };

    Ok(Some(Event {
        key: raw.key,
        action,
    }))
}
