//! Error types for data parsing in vitalband-types.

use thiserror::Error;

/// Errors that can occur when parsing band data model values from text.
///
/// Platform-agnostic: transport and codec errors belong in vitalband-core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Unknown metric name.
    #[error("Unknown metric '{0}' (expected one of heart_rate, blood_oxygen, blood_pressure, temperature, steps, sleep)")]
    UnknownMetric(String),

    /// Unknown sleep stage name.
    #[error("Unknown sleep stage '{0}'")]
    UnknownSleepStage(String),

    /// A calendar day string that is not `yyyy.MM.dd` or `yyyy-MM-dd`.
    #[error("Invalid day '{0}': expected yyyy.MM.dd")]
    InvalidDay(String),
}

/// Result type alias using vitalband-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
