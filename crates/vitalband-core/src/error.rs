//! Error types for vitalband-core.
//!
//! # Containment
//!
//! Most failures never reach a caller. Anything that goes wrong while a
//! frame is being processed is logged and the frame (or the single record)
//! is dropped; the ingestion loop keeps running. Errors surface only from
//! explicit operations:
//!
//! | Error | Raised by | Caller action |
//! |-------|-----------|---------------|
//! | [`Error::PermissionDenied`] | `scan()`, `connect()` | Obtain Bluetooth permissions, then retry |
//! | [`Error::NotConnected`] | spot measurement, sync, battery refresh | Wait for the link, then retry |
//! | [`Error::WriteFailed`] | spot measurement | Retry once the link is stable |
//! | [`Error::Codec`] | spot measurement | Do not retry; the codec cannot build the command |
//! | [`Error::Transport`] / [`Error::Bluetooth`] | `scan()`, `connect()` | Retry or rescan |
//! | [`Error::InvalidConfig`] | config loading | Fix configuration and restart |
//!
//! Inside the pipeline the remaining variants are used as diagnostics:
//!
//! - [`Error::Validation`]: a record was missing a required field
//! - [`Error::ParseFallbackExhausted`]: no timestamp format matched
//! - [`Error::Storage`]: a write to the storage collaborator failed

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the session core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Capability/permission check failed before any transport call.
    #[error("Required Bluetooth capabilities are not granted")]
    PermissionDenied,

    /// Bluetooth Low Energy error from the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Transport-level failure during scan, connect, discovery or enablement.
    #[error("Transport failure during {operation}: {reason}")]
    Transport {
        /// The transport operation that failed.
        operation: String,
        /// Description of the failure.
        reason: String,
    },

    /// Device not known to the transport.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted while the link is not at least Connected.
    #[error("Not connected to device")]
    NotConnected,

    /// Required characteristic missing from the resolved service layout.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// A write was rejected by the transport.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Command encoding or frame decoding failed.
    #[error("Codec failure: {0}")]
    Codec(String),

    /// A decoded record was missing a required field or had an invalid value.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// None of the supported timestamp formats matched.
    #[error("No timestamp format matched '{input}'")]
    ParseFallbackExhausted {
        /// The offending timestamp text.
        input: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled, usually by a disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// The storage collaborator reported a failure.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport failure with operation context.
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<vitalband_types::ParseError> for Error {
    fn from(err: vitalband_types::ParseError) -> Self {
        Error::Validation(err.to_string())
    }
}

/// Result type alias using vitalband-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::PermissionDenied.to_string(),
            "Required Bluetooth capabilities are not granted"
        );
        assert_eq!(Error::NotConnected.to_string(), "Not connected to device");

        let err = Error::transport("connect", "link refused");
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("link refused"));

        let err = Error::characteristic_not_found("0000fff7", 3);
        assert!(err.to_string().contains("0000fff7"));
        assert!(err.to_string().contains("3 services"));

        let err = Error::ParseFallbackExhausted {
            input: "yesterday".to_string(),
        };
        assert!(err.to_string().contains("yesterday"));

        let err = Error::timeout("notification ack", Duration::from_secs(2));
        assert!(err.to_string().contains("2s"));
    }

    #[test]
    fn test_from_parse_error() {
        let parse: vitalband_types::ParseError = "co2".parse::<vitalband_types::Metric>().unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("co2"));
    }
}
