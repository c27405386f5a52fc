//! Platform-agnostic types for fitness band telemetry.
//!
//! This crate holds the data model shared by the session core, the store
//! and front ends. It performs no I/O.
//!
//! # Features
//!
//! - Typed samples for every metric the band reports
//! - Link state and battery level values
//! - Sleep stage decoding and nightly summaries
//! - UUID constants for the band's BLE service
//! - Calendar-day helpers (`yyyy.MM.dd`)
//!
//! # Example
//!
//! ```
//! use vitalband_types::{Metric, SleepStage};
//!
//! let metric: Metric = "spo2".parse().unwrap();
//! assert_eq!(metric, Metric::BloodOxygen);
//! assert_eq!(SleepStage::from_code(15.0, 5), SleepStage::Rem);
//! ```

pub mod error;
pub mod sleep;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use sleep::{DEFAULT_SLEEP_GOAL_MINUTES, SleepRating, SleepSummary};
pub use types::{
    BatteryLevel, BloodOxygenSample, BloodPressureSample, DeviceDetails, HeartRateSample,
    LinkState, Metric, SleepStage, SleepStageSample, SpotMeasurement, StepSample,
    TemperatureSample, TypedSample, calendar_day, calendar_day_of_millis, canonical_day,
    parse_day,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_rating_thresholds() {
        assert_eq!(SleepRating::from_score(100), SleepRating::Excellent);
        assert_eq!(SleepRating::from_score(80), SleepRating::Excellent);
        assert_eq!(SleepRating::from_score(79), SleepRating::Normal);
        assert_eq!(SleepRating::from_score(60), SleepRating::Normal);
        assert_eq!(SleepRating::from_score(59), SleepRating::Poor);
        assert_eq!(SleepRating::from_score(0), SleepRating::Poor);
    }

    #[test]
    fn test_reexported_uuids() {
        assert_eq!(uuids::BAND_SERVICE, uuid::BAND_SERVICE);
    }
}
