//! Core types for band telemetry.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::error::{ParseError, ParseResult};

/// Physiological quantity reported by the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Metric {
    HeartRate,
    BloodOxygen,
    BloodPressure,
    Temperature,
    Steps,
    Sleep,
}

impl Metric {
    /// Every metric, in the order history is synchronised.
    pub const ALL: [Metric; 6] = [
        Metric::HeartRate,
        Metric::BloodOxygen,
        Metric::BloodPressure,
        Metric::Sleep,
        Metric::Steps,
        Metric::Temperature,
    ];

    /// Stable snake_case name, also used for storage table names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HeartRate => "heart_rate",
            Metric::BloodOxygen => "blood_oxygen",
            Metric::BloodPressure => "blood_pressure",
            Metric::Temperature => "temperature",
            Metric::Steps => "steps",
            Metric::Sleep => "sleep",
        }
    }

    /// Whether the metric has an in-memory live feed.
    ///
    /// Sleep stages only ever arrive in historical batches.
    #[must_use]
    pub fn has_live_feed(&self) -> bool {
        !matches!(self, Metric::Sleep)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "heart_rate" | "hr" | "heartrate" => Ok(Metric::HeartRate),
            "blood_oxygen" | "spo2" | "oxygen" => Ok(Metric::BloodOxygen),
            "blood_pressure" | "bp" => Ok(Metric::BloodPressure),
            "temperature" | "temp" => Ok(Metric::Temperature),
            "steps" | "step" => Ok(Metric::Steps),
            "sleep" => Ok(Metric::Sleep),
            _ => Err(ParseError::UnknownMetric(s.to_string())),
        }
    }
}

/// Lifecycle of the wireless link.
///
/// Ordered so that `state >= LinkState::Connected` means a characteristic
/// set has been resolved and writes are possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    StreamingReady,
}

impl LinkState {
    /// Returns true once the link is up (Connected or StreamingReady).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self >= LinkState::Connected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::StreamingReady => write!(f, "streaming"),
        }
    }
}

/// Battery charge reported by the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BatteryLevel {
    /// Not reported since the session started (or since the last disconnect).
    #[default]
    Unknown,
    /// Charge in percent, 0 to 100.
    Percent(u8),
}

impl BatteryLevel {
    /// Sentinel used where a plain integer is required.
    pub const UNKNOWN_SENTINEL: i32 = -1;

    /// Build a level from a raw device value, rejecting anything outside 0..=100.
    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        u8::try_from(raw)
            .ok()
            .filter(|level| *level <= 100)
            .map(BatteryLevel::Percent)
    }

    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        match self {
            BatteryLevel::Unknown => None,
            BatteryLevel::Percent(p) => Some(*p),
        }
    }

    /// The level as an integer, or [`Self::UNKNOWN_SENTINEL`].
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        self.percent().map_or(Self::UNKNOWN_SENTINEL, i32::from)
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryLevel::Unknown => write!(f, "unknown"),
            BatteryLevel::Percent(p) => write!(f, "{}%", p),
        }
    }
}

/// Sleep stage decoded from a sleep quality code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SleepStage {
    Deep,
    Light,
    Rem,
    Awake,
}

impl SleepStage {
    /// Decode a code recorded at one-minute resolution.
    ///
    /// Codes 1, 2 and 3 are Deep, Light and REM; anything else is Awake.
    #[must_use]
    pub fn from_minute_code(code: f32) -> Self {
        if code.fract() != 0.0 {
            return SleepStage::Awake;
        }
        match code as i64 {
            1 => SleepStage::Deep,
            2 => SleepStage::Light,
            3 => SleepStage::Rem,
            _ => SleepStage::Awake,
        }
    }

    /// Decode a code recorded at coarser resolution, where the code is a
    /// continuous movement scale.
    ///
    /// | Code | Stage |
    /// |------|-------|
    /// | `[0, 2]` | Deep |
    /// | `(2, 8]` | Light |
    /// | `(8, 20]` | REM |
    /// | anything else | Awake |
    #[must_use]
    pub fn from_scaled_code(code: f32) -> Self {
        if (0.0..=2.0).contains(&code) {
            SleepStage::Deep
        } else if code > 2.0 && code <= 8.0 {
            SleepStage::Light
        } else if code > 8.0 && code <= 20.0 {
            SleepStage::Rem
        } else {
            SleepStage::Awake
        }
    }

    /// Decode a code given the record's unit length in minutes.
    #[must_use]
    pub fn from_code(code: f32, unit_minutes: u16) -> Self {
        if unit_minutes == 1 {
            Self::from_minute_code(code)
        } else {
            Self::from_scaled_code(code)
        }
    }

    #[must_use]
    pub fn is_asleep(&self) -> bool {
        !matches!(self, SleepStage::Awake)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepStage::Deep => "deep",
            SleepStage::Light => "light",
            SleepStage::Rem => "rem",
            SleepStage::Awake => "awake",
        }
    }
}

impl fmt::Display for SleepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SleepStage {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deep" => Ok(SleepStage::Deep),
            "light" => Ok(SleepStage::Light),
            "rem" => Ok(SleepStage::Rem),
            "awake" => Ok(SleepStage::Awake),
            _ => Err(ParseError::UnknownSleepStage(s.to_string())),
        }
    }
}

/// Spot measurement the band can run on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SpotMeasurement {
    HeartRate,
    BloodOxygen,
}

/// Informational identity reported by the band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceDetails {
    pub firmware_version: Option<String>,
    pub mac_address: Option<String>,
}

/// A single heart-rate reading.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeartRateSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub bpm: u16,
}

/// A single blood-oxygen saturation reading.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BloodOxygenSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub percent: u8,
}

/// A blood-pressure reading. `heart_rate` is 0 when the band did not report one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BloodPressureSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub systolic: u16,
    pub diastolic: u16,
    pub heart_rate: u16,
}

/// A body temperature reading in degrees Celsius.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TemperatureSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub celsius: f32,
}

/// Activity totals. Distance and calories are in the band's own units.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub steps: u32,
    pub distance: f32,
    pub calories: f32,
}

/// One slot of a sleep record.
///
/// `day` is the day of the record's anchor time, so every stage of a night
/// shares the day the night started on.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SleepStageSample {
    pub timestamp_millis: i64,
    pub day: String,
    pub code: f32,
    pub stage: SleepStage,
    pub unit_minutes: u16,
}

/// A normalized sample of any metric.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "metric", rename_all = "snake_case"))]
pub enum TypedSample {
    HeartRate(HeartRateSample),
    BloodOxygen(BloodOxygenSample),
    BloodPressure(BloodPressureSample),
    Temperature(TemperatureSample),
    Steps(StepSample),
    Sleep(SleepStageSample),
}

impl TypedSample {
    #[must_use]
    pub fn metric(&self) -> Metric {
        match self {
            TypedSample::HeartRate(_) => Metric::HeartRate,
            TypedSample::BloodOxygen(_) => Metric::BloodOxygen,
            TypedSample::BloodPressure(_) => Metric::BloodPressure,
            TypedSample::Temperature(_) => Metric::Temperature,
            TypedSample::Steps(_) => Metric::Steps,
            TypedSample::Sleep(_) => Metric::Sleep,
        }
    }

    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        match self {
            TypedSample::HeartRate(s) => s.timestamp_millis,
            TypedSample::BloodOxygen(s) => s.timestamp_millis,
            TypedSample::BloodPressure(s) => s.timestamp_millis,
            TypedSample::Temperature(s) => s.timestamp_millis,
            TypedSample::Steps(s) => s.timestamp_millis,
            TypedSample::Sleep(s) => s.timestamp_millis,
        }
    }

    #[must_use]
    pub fn day(&self) -> &str {
        match self {
            TypedSample::HeartRate(s) => &s.day,
            TypedSample::BloodOxygen(s) => &s.day,
            TypedSample::BloodPressure(s) => &s.day,
            TypedSample::Temperature(s) => &s.day,
            TypedSample::Steps(s) => &s.day,
            TypedSample::Sleep(s) => &s.day,
        }
    }
}

impl fmt::Display for TypedSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedSample::HeartRate(s) => write!(f, "{} bpm", s.bpm),
            TypedSample::BloodOxygen(s) => write!(f, "{}% SpO2", s.percent),
            TypedSample::BloodPressure(s) => {
                write!(f, "{}/{} mmHg", s.systolic, s.diastolic)?;
                if s.heart_rate > 0 {
                    write!(f, " @ {} bpm", s.heart_rate)?;
                }
                Ok(())
            }
            TypedSample::Temperature(s) => write!(f, "{:.1} °C", s.celsius),
            TypedSample::Steps(s) => write!(
                f,
                "{} steps, distance {:.2}, {:.1} kcal",
                s.steps, s.distance, s.calories
            ),
            TypedSample::Sleep(s) => write!(f, "{} (code {})", s.stage, s.code),
        }
    }
}

macro_rules! impl_from_sample {
    ($($sample:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$sample> for TypedSample {
                fn from(sample: $sample) -> Self {
                    TypedSample::$variant(sample)
                }
            }
        )*
    };
}

impl_from_sample! {
    HeartRateSample => HeartRate,
    BloodOxygenSample => BloodOxygen,
    BloodPressureSample => BloodPressure,
    TemperatureSample => Temperature,
    StepSample => Steps,
    SleepStageSample => Sleep,
}

/// Format the calendar day of a timestamp as `yyyy.MM.dd`.
#[must_use]
pub fn calendar_day(at: OffsetDateTime) -> String {
    format!(
        "{:04}.{:02}.{:02}",
        at.year(),
        u8::from(at.month()),
        at.day()
    )
}

/// Calendar day of an epoch-millisecond timestamp in the given offset.
///
/// Returns `None` when the timestamp is outside the representable range.
#[must_use]
pub fn calendar_day_of_millis(timestamp_millis: i64, offset: UtcOffset) -> Option<String> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_millis) * 1_000_000)
        .ok()
        .map(|at| calendar_day(at.to_offset(offset)))
}

/// Parse a day string in `yyyy.MM.dd` or `yyyy-MM-dd` form.
pub fn parse_day(s: &str) -> ParseResult<Date> {
    let invalid = || ParseError::InvalidDay(s.to_string());
    let mut parts = s.trim().split(['.', '-']);
    let (Some(year), Some(month), Some(day), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u8 = month.parse().map_err(|_| invalid())?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

/// Normalize a day string to the canonical `yyyy.MM.dd` form.
pub fn canonical_day(s: &str) -> ParseResult<String> {
    let date = parse_day(s)?;
    Ok(format!(
        "{:04}.{:02}.{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_metric_round_trips_through_str() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
    }

    #[test]
    fn test_metric_aliases() {
        assert_eq!("SpO2".parse::<Metric>().unwrap(), Metric::BloodOxygen);
        assert_eq!("heart-rate".parse::<Metric>().unwrap(), Metric::HeartRate);
        assert_eq!("bp".parse::<Metric>().unwrap(), Metric::BloodPressure);
        assert!("co2".parse::<Metric>().is_err());
    }

    #[test]
    fn test_only_sleep_lacks_live_feed() {
        let without: Vec<_> = Metric::ALL.iter().filter(|m| !m.has_live_feed()).collect();
        assert_eq!(without, vec![&Metric::Sleep]);
    }

    #[test]
    fn test_link_state_ordering() {
        assert!(!LinkState::Disconnected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(LinkState::Connected.is_connected());
        assert!(LinkState::StreamingReady.is_connected());
        assert_eq!(LinkState::default(), LinkState::Disconnected);
    }

    #[test]
    fn test_battery_level_from_raw() {
        assert_eq!(BatteryLevel::from_raw(0), Some(BatteryLevel::Percent(0)));
        assert_eq!(BatteryLevel::from_raw(100), Some(BatteryLevel::Percent(100)));
        assert_eq!(BatteryLevel::from_raw(101), None);
        assert_eq!(BatteryLevel::from_raw(-1), None);
        assert_eq!(BatteryLevel::Unknown.as_i32(), -1);
        assert_eq!(BatteryLevel::Percent(42).as_i32(), 42);
        assert_eq!(BatteryLevel::Percent(42).to_string(), "42%");
    }

    #[test]
    fn test_minute_codes() {
        let stages: Vec<_> = [1.0, 2.0, 3.0, 9.0, 0.0]
            .into_iter()
            .map(SleepStage::from_minute_code)
            .collect();
        assert_eq!(
            stages,
            vec![
                SleepStage::Deep,
                SleepStage::Light,
                SleepStage::Rem,
                SleepStage::Awake,
                SleepStage::Awake
            ]
        );
    }

    #[test]
    fn test_scaled_code_boundaries() {
        assert_eq!(SleepStage::from_scaled_code(0.0), SleepStage::Deep);
        assert_eq!(SleepStage::from_scaled_code(1.5), SleepStage::Deep);
        assert_eq!(SleepStage::from_scaled_code(2.0), SleepStage::Deep);
        assert_eq!(SleepStage::from_scaled_code(2.01), SleepStage::Light);
        assert_eq!(SleepStage::from_scaled_code(5.0), SleepStage::Light);
        assert_eq!(SleepStage::from_scaled_code(8.0), SleepStage::Light);
        assert_eq!(SleepStage::from_scaled_code(8.5), SleepStage::Rem);
        assert_eq!(SleepStage::from_scaled_code(15.0), SleepStage::Rem);
        assert_eq!(SleepStage::from_scaled_code(20.0), SleepStage::Rem);
        assert_eq!(SleepStage::from_scaled_code(25.0), SleepStage::Awake);
        assert_eq!(SleepStage::from_scaled_code(-1.0), SleepStage::Awake);
    }

    #[test]
    fn test_from_code_selects_scale_by_unit() {
        assert_eq!(SleepStage::from_code(5.0, 1), SleepStage::Awake);
        assert_eq!(SleepStage::from_code(5.0, 5), SleepStage::Light);
    }

    #[test]
    fn test_calendar_day() {
        assert_eq!(calendar_day(datetime!(2024-03-01 23:59:59 UTC)), "2024.03.01");
        let millis = datetime!(2024-03-01 23:30 UTC).unix_timestamp() * 1000;
        let plus_one = UtcOffset::from_hms(1, 0, 0).unwrap();
        assert_eq!(
            calendar_day_of_millis(millis, plus_one).as_deref(),
            Some("2024.03.02")
        );
    }

    #[test]
    fn test_parse_day_accepts_both_separators() {
        let dotted = parse_day("2024.03.01").unwrap();
        let dashed = parse_day("2024-03-01").unwrap();
        assert_eq!(dotted, dashed);
        assert_eq!(canonical_day("2024-3-1").unwrap(), "2024.03.01");
        assert!(parse_day("2024.13.01").is_err());
        assert!(parse_day("yesterday").is_err());
        assert!(parse_day("2024.03.01.02").is_err());
    }

    #[test]
    fn test_typed_sample_accessors() {
        let sample: TypedSample = BloodPressureSample {
            timestamp_millis: 1_000,
            day: "2024.03.01".into(),
            systolic: 120,
            diastolic: 80,
            heart_rate: 0,
        }
        .into();
        assert_eq!(sample.metric(), Metric::BloodPressure);
        assert_eq!(sample.timestamp_millis(), 1_000);
        assert_eq!(sample.day(), "2024.03.01");
        assert_eq!(sample.to_string(), "120/80 mmHg");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_typed_sample_serializes_with_metric_tag() {
        let sample = TypedSample::HeartRate(HeartRateSample {
            timestamp_millis: 5,
            day: "2024.03.01".into(),
            bpm: 72,
        });
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["metric"], "heart_rate");
        assert_eq!(json["bpm"], 72);
        let back: TypedSample = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample);
    }
}
