//! Outbound band commands.
//!
//! The wire encoding of each command belongs to the band's codec, which the
//! core sees only through [`CommandCodec`]. This module defines the typed
//! command set and [`CommandBuilder`], which turns commands into bytes.
//!
//! Builders never fail: when the codec cannot encode a command the builder
//! returns an empty byte sequence, and callers skip the write.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{debug, warn};

use vitalband_types::SpotMeasurement;

use crate::error::Result;
use crate::frame::FramePayload;

/// History data set a history request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryCategory {
    HeartRate,
    DynamicHeartRate,
    BloodOxygen,
    /// HRV query; the band answers with blood-pressure records.
    Hrv,
    Sleep,
    DetailedSleep,
    TotalSteps,
    DetailedSteps,
    Temperature,
}

impl HistoryCategory {
    /// Categories requested by a historical sync, in request order.
    pub const SYNC_ORDER: [HistoryCategory; 6] = [
        HistoryCategory::HeartRate,
        HistoryCategory::BloodOxygen,
        HistoryCategory::Hrv,
        HistoryCategory::Sleep,
        HistoryCategory::TotalSteps,
        HistoryCategory::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryCategory::HeartRate => "heart_rate",
            HistoryCategory::DynamicHeartRate => "dynamic_heart_rate",
            HistoryCategory::BloodOxygen => "blood_oxygen",
            HistoryCategory::Hrv => "hrv",
            HistoryCategory::Sleep => "sleep",
            HistoryCategory::DetailedSleep => "detailed_sleep",
            HistoryCategory::TotalSteps => "total_steps",
            HistoryCategory::DetailedSteps => "detailed_steps",
            HistoryCategory::Temperature => "temperature",
        }
    }
}

/// Pagination mode of a history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CursorMode {
    /// Read from the oldest stored record.
    #[default]
    Start,
    /// Continue after the previous page.
    Continue,
    /// Erase the stored records of the category.
    Delete,
}

impl CursorMode {
    /// Mode byte sent to the band.
    pub fn code(&self) -> u8 {
        match self {
            CursorMode::Start => 0x00,
            CursorMode::Continue => 0x02,
            CursorMode::Delete => 0x99,
        }
    }
}

/// Pagination cursor: a mode and an optional last seen date.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryCursor {
    pub mode: CursorMode,
    pub last_date: Option<String>,
}

impl HistoryCursor {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn continue_from(last_date: impl Into<String>) -> Self {
        Self {
            mode: CursorMode::Continue,
            last_date: Some(last_date.into()),
        }
    }

    pub fn delete() -> Self {
        Self {
            mode: CursorMode::Delete,
            last_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Female,
    Male,
}

/// Wearer profile used by the band for calorie and distance estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonalInfo {
    pub sex: Sex,
    pub age: u8,
    pub height_cm: u8,
    pub weight_kg: u8,
    pub stride_cm: u8,
}

/// A command the band understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDeviceTime(OffsetDateTime),
    GetDeviceTime,
    SetPersonalInfo(PersonalInfo),
    BatteryLevel,
    FirmwareVersion,
    MacAddress,
    /// Start (or stop) the live telemetry stream.
    EnableRealtime { steps: bool, temperature: bool },
    /// Start or stop a timed on-device measurement.
    StartMeasurement {
        kind: SpotMeasurement,
        seconds: u16,
        enable: bool,
    },
    History {
        category: HistoryCategory,
        cursor: HistoryCursor,
    },
}

impl Command {
    /// Short name for logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetDeviceTime(_) => "set_device_time",
            Command::GetDeviceTime => "get_device_time",
            Command::SetPersonalInfo(_) => "set_personal_info",
            Command::BatteryLevel => "battery_level",
            Command::FirmwareVersion => "firmware_version",
            Command::MacAddress => "mac_address",
            Command::EnableRealtime { .. } => "enable_realtime",
            Command::StartMeasurement { enable: true, .. } => "start_measurement",
            Command::StartMeasurement { enable: false, .. } => "stop_measurement",
            Command::History { category, .. } => match category {
                HistoryCategory::HeartRate => "history_heart_rate",
                HistoryCategory::DynamicHeartRate => "history_dynamic_heart_rate",
                HistoryCategory::BloodOxygen => "history_blood_oxygen",
                HistoryCategory::Hrv => "history_hrv",
                HistoryCategory::Sleep => "history_sleep",
                HistoryCategory::DetailedSleep => "history_detailed_sleep",
                HistoryCategory::TotalSteps => "history_total_steps",
                HistoryCategory::DetailedSteps => "history_detailed_steps",
                HistoryCategory::Temperature => "history_temperature",
            },
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The band's binary protocol codec.
pub trait CommandCodec: Send + Sync {
    /// Encode a command into the bytes written to the band.
    fn encode(&self, command: &Command) -> Result<Bytes>;

    /// Decode one inbound notification into a frame payload.
    fn decode_frame(&self, bytes: &[u8]) -> Result<FramePayload>;
}

/// Builds outbound byte sequences through a [`CommandCodec`].
#[derive(Clone)]
pub struct CommandBuilder {
    codec: Arc<dyn CommandCodec>,
}

impl fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuilder").finish_non_exhaustive()
    }
}

impl CommandBuilder {
    pub fn new(codec: Arc<dyn CommandCodec>) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &Arc<dyn CommandCodec> {
        &self.codec
    }

    /// Encode `command`, or return empty bytes if the codec fails.
    pub fn build(&self, command: &Command) -> Bytes {
        match self.codec.encode(command) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    debug!(command = command.name(), "Codec produced no bytes");
                }
                bytes
            }
            Err(e) => {
                warn!(command = command.name(), error = %e, "Failed to encode command");
                Bytes::new()
            }
        }
    }

    pub fn set_device_time(&self, now: OffsetDateTime) -> Bytes {
        self.build(&Command::SetDeviceTime(now))
    }

    pub fn get_device_time(&self) -> Bytes {
        self.build(&Command::GetDeviceTime)
    }

    pub fn set_personal_info(&self, info: PersonalInfo) -> Bytes {
        self.build(&Command::SetPersonalInfo(info))
    }

    pub fn battery_level(&self) -> Bytes {
        self.build(&Command::BatteryLevel)
    }

    pub fn firmware_version(&self) -> Bytes {
        self.build(&Command::FirmwareVersion)
    }

    pub fn mac_address(&self) -> Bytes {
        self.build(&Command::MacAddress)
    }

    pub fn enable_realtime(&self, steps: bool, temperature: bool) -> Bytes {
        self.build(&Command::EnableRealtime { steps, temperature })
    }

    pub fn start_measurement(&self, kind: SpotMeasurement, seconds: u16) -> Bytes {
        self.build(&Command::StartMeasurement {
            kind,
            seconds,
            enable: true,
        })
    }

    pub fn stop_measurement(&self, kind: SpotMeasurement) -> Bytes {
        self.build(&Command::StartMeasurement {
            kind,
            seconds: 0,
            enable: false,
        })
    }

    pub fn history(&self, category: HistoryCategory, cursor: HistoryCursor) -> Bytes {
        self.build(&Command::History { category, cursor })
    }
}
