//! Session configuration.
//!
//! Durations are stored as integer milliseconds so configuration files stay
//! readable. Every section uses `#[serde(default)]`, so a file only needs
//! the values it changes.
//!
//! ```toml
//! [link]
//! settle_delay_ms = 300
//! ack_timeout_ms = 2000
//!
//! [ingest]
//! debounce_ms = 2000
//! utc_offset_minutes = 60
//! merge_policy = "newest_timestamp"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::UtcOffset;
use uuid::Uuid;

use vitalband_types::uuids::{BAND_SERVICE, NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};

use crate::reconcile::MergePolicy;

/// Default number of samples returned by recent-history queries.
pub const DEFAULT_RECENT_LIMIT: usize = 500;

/// Configuration for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub choreography: ChoreographyConfig,
    pub ingest: IngestConfig,
}

impl SessionConfig {
    /// Load configuration from the default path, or defaults if the file is missing.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate every section, reporting all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.link.validate());
        errors.extend(self.choreography.validate());
        errors.extend(self.ingest.validate());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Link lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Pause between link-up and the discovery request.
    pub settle_delay_ms: u64,
    /// How long to wait for the notification acknowledgement before
    /// treating the link as ready anyway.
    pub ack_timeout_ms: u64,
    pub service_uuid: Uuid,
    pub notify_characteristic: Uuid,
    pub write_characteristic: Uuid,
    /// Inbound frames buffered between the link and the session.
    pub frame_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 300,
            ack_timeout_ms: 2_000,
            service_uuid: BAND_SERVICE,
            notify_characteristic: NOTIFY_CHARACTERISTIC,
            write_characteristic: WRITE_CHARACTERISTIC,
            frame_buffer: 256,
        }
    }
}

impl LinkConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.ack_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "link.ack_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.frame_buffer == 0 {
            errors.push(ValidationError::new(
                "link.frame_buffer",
                "must be greater than 0",
            ));
        }
        if self.notify_characteristic == self.write_characteristic {
            errors.push(ValidationError::new(
                "link.write_characteristic",
                "must differ from the notify characteristic",
            ));
        }
        errors
    }
}

/// Command pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoreographyConfig {
    /// Gap after set-time and after the battery query.
    pub command_gap_ms: u64,
    /// Gap after enabling live streaming, before the history sync.
    pub streaming_settle_ms: u64,
    /// Gap between history requests.
    pub history_pacing_ms: u64,
    pub spot_measurement_secs: u16,
    /// Ask the live stream to include temperature.
    pub realtime_temperature: bool,
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            command_gap_ms: 500,
            streaming_settle_ms: 2_000,
            history_pacing_ms: 1_000,
            spot_measurement_secs: 30,
            realtime_temperature: true,
        }
    }
}

impl ChoreographyConfig {
    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    pub fn streaming_settle(&self) -> Duration {
        Duration::from_millis(self.streaming_settle_ms)
    }

    pub fn history_pacing(&self) -> Duration {
        Duration::from_millis(self.history_pacing_ms)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.command_gap_ms == 0 {
            errors.push(ValidationError::new(
                "choreography.command_gap_ms",
                "must be greater than 0; the band drops back-to-back commands",
            ));
        }
        if self.history_pacing_ms == 0 {
            errors.push(ValidationError::new(
                "choreography.history_pacing_ms",
                "must be greater than 0; the band drops back-to-back commands",
            ));
        }
        if !(1..=300).contains(&self.spot_measurement_secs) {
            errors.push(ValidationError::new(
                "choreography.spot_measurement_secs",
                format!(
                    "must be between 1 and 300 seconds, got {}",
                    self.spot_measurement_secs
                ),
            ));
        }
        errors
    }
}

/// Inbound data handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Trailing debounce window for live telemetry.
    pub debounce_ms: u64,
    /// Frames buffered by the live telemetry lane. Other lanes are unbounded.
    pub lane_buffer: usize,
    /// Offset in which the band's wall-clock timestamps are interpreted.
    pub utc_offset_minutes: i32,
    pub merge_policy: MergePolicy,
    pub recent_limit: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            lane_buffer: 64,
            utc_offset_minutes: 0,
            merge_policy: MergePolicy::default(),
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

impl IngestConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The configured offset, or UTC if it is out of range.
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or(UtcOffset::UTC)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.debounce_ms > 60_000 {
            errors.push(ValidationError::new(
                "ingest.debounce_ms",
                format!("must be at most 60000, got {}", self.debounce_ms),
            ));
        }
        if self.lane_buffer == 0 {
            errors.push(ValidationError::new(
                "ingest.lane_buffer",
                "must be greater than 0",
            ));
        }
        if !(-18 * 60..=18 * 60).contains(&self.utc_offset_minutes) {
            errors.push(ValidationError::new(
                "ingest.utc_offset_minutes",
                format!(
                    "must be within +/-1080 minutes, got {}",
                    self.utc_offset_minutes
                ),
            ));
        }
        if self.recent_limit == 0 {
            errors.push(ValidationError::new(
                "ingest.recent_limit",
                "must be greater than 0",
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        crate::error::Error::InvalidConfig(err.to_string())
    }
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path, e.g. `ingest.debounce_ms`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vitalband")
        .join("config.toml")
}
