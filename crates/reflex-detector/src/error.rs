//! Error types for detector configuration.
//!
//! The detector itself never fails at runtime; everything here is
//! raised while building thresholds or loading a config file.

use thiserror::Error;

/// Result type alias for detector configuration.
pub type DetectorResult<T> = Result<T, DetectorError>;

/// Errors raised while configuring a detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("lower limit {lower} must be below upper limit {upper}")]
    LimitsOutOfOrder { lower: u32, upper: u32 },

    #[error("buffer length must be at least 1")]
    ZeroBufferLength,

    #[error("port key {0} does not fit in 16 bits")]
    PortOutOfRange(u32),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
}
