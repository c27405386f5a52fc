//! Conversion of decoded frame payloads into typed samples.
//!
//! Every function here is pure: it takes the payload of a [`RawFrame`] and
//! returns samples plus a list of rejected records. Logging is left to the
//! caller.
//!
//! # Resilience rules
//!
//! - Numbers are read through [`DecodedValue::as_i64`]/[`DecodedValue::as_f64`],
//!   so native numbers and numeric text are both accepted.
//! - Each metric has a list of field-name synonyms (see [`fields`]); the
//!   first synonym holding a usable value wins.
//! - Timestamps go through the [`TimestampParser`] fallback chain.
//! - A record that fails a check is rejected on its own; the rest of the
//!   batch is still converted.
//!
//! [`RawFrame`]: crate::frame::RawFrame

use time::OffsetDateTime;

use vitalband_types::{
    BatteryLevel, BloodOxygenSample, BloodPressureSample, HeartRateSample, Metric,
    SleepStage, SleepStageSample, StepSample, TemperatureSample, TypedSample, calendar_day,
};

use crate::error::{Error, Result};
use crate::timestamp::TimestampParser;
use crate::value::{DecodedValue, Record};

/// Field-name synonyms, in priority order.
pub mod fields {
    pub const DATE: &[&str] = &["date"];
    pub const HEART_RATE_HISTORY: &[&str] = &["onceHeartValue", "heartRate"];
    pub const HEART_RATE_LIVE: &[&str] = &["heartRate"];
    pub const BLOOD_OXYGEN: &[&str] = &["Blood_oxygen", "Bloodoxygen"];
    pub const SYSTOLIC: &[&str] = &["highBP"];
    pub const DIASTOLIC: &[&str] = &["lowBP"];
    pub const PULSE: &[&str] = &["heartRate"];
    pub const TEMPERATURE_HISTORY: &[&str] = &["temperature", "TempData"];
    pub const TEMPERATURE_LIVE: &[&str] = &["TempData", "temperature"];
    pub const STEPS: &[&str] = &["step", "allstep"];
    pub const DISTANCE: &[&str] = &["distance"];
    pub const CALORIES: &[&str] = &["calories", "calorie"];
    pub const SLEEP_CODES: &[&str] = &["arraySleepQuality"];
    pub const SLEEP_UNIT: &[&str] = &["sleepUnitLength"];
    pub const BATTERY: &[&str] = &["batteryLevel"];
    pub const FIRMWARE: &[&str] = &["deviceVersion", "version", "firmwareVersion"];
    pub const MAC: &[&str] = &["macAddress", "mac", "address"];
}

/// Longest sleep slot accepted, one day.
const MAX_SLEEP_UNIT_MINUTES: i64 = 24 * 60;

/// A record that could not be converted.
#[derive(Debug)]
pub struct Rejection {
    /// Position of the record in the payload.
    pub index: usize,
    pub reason: Error,
}

/// Result of converting one payload.
#[derive(Debug)]
pub struct Batch<T> {
    pub samples: Vec<T>,
    pub rejected: Vec<Rejection>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> Batch<T> {
    fn from_records<F>(data: &DecodedValue, mut convert: F) -> Self
    where
        F: FnMut(&Record) -> Result<Vec<T>>,
    {
        let mut batch = Batch::default();
        for (index, record) in data.records().into_iter().enumerate() {
            match convert(record) {
                Ok(samples) => batch.samples.extend(samples),
                Err(reason) => batch.rejected.push(Rejection { index, reason }),
            }
        }
        batch
    }

    /// Convert the samples into another type, keeping the rejections.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Batch<U> {
        Batch {
            samples: self.samples.into_iter().map(f).collect(),
            rejected: self.rejected,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.rejected.is_empty()
    }
}

/// Values carried by one live telemetry frame.
///
/// A metric is present only when the frame carried a positive value for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSnapshot {
    pub heart_rate: Option<HeartRateSample>,
    pub blood_oxygen: Option<BloodOxygenSample>,
    pub blood_pressure: Option<BloodPressureSample>,
    pub temperature: Option<TemperatureSample>,
    pub steps: Option<StepSample>,
}

impl LiveSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.blood_oxygen.is_none()
            && self.blood_pressure.is_none()
            && self.temperature.is_none()
            && self.steps.is_none()
    }

    /// The present values as typed samples.
    #[must_use]
    pub fn into_samples(self) -> Vec<TypedSample> {
        let mut samples = Vec::new();
        samples.extend(self.heart_rate.map(TypedSample::from));
        samples.extend(self.blood_oxygen.map(TypedSample::from));
        samples.extend(self.blood_pressure.map(TypedSample::from));
        samples.extend(self.temperature.map(TypedSample::from));
        samples.extend(self.steps.map(TypedSample::from));
        samples
    }
}

/// First synonym holding a number.
fn first_number(record: &Record, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find_map(DecodedValue::as_f64)
}

/// First synonym holding a positive number.
fn first_positive(record: &Record, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .filter_map(DecodedValue::as_f64)
        .find(|v| *v > 0.0)
}

fn first_text<'a>(record: &'a Record, keys: &[&str]) -> Option<std::borrow::Cow<'a, str>> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find_map(DecodedValue::as_text)
        .filter(|text| !text.trim().is_empty())
}

fn required_positive(record: &Record, keys: &[&str], what: &str) -> Result<f64> {
    match first_number(record, keys) {
        Some(v) if v > 0.0 => Ok(v),
        Some(v) => Err(Error::validation(format!("{what} must be positive, got {v}"))),
        None => Err(Error::validation(format!("missing {what}"))),
    }
}

fn to_u16(value: f64, what: &str) -> Result<u16> {
    let whole = value.trunc();
    if (0.0..=f64::from(u16::MAX)).contains(&whole) {
        Ok(whole as u16)
    } else {
        Err(Error::validation(format!("{what} out of range: {value}")))
    }
}

/// Converts frame payloads into typed samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    timestamps: TimestampParser,
}

impl Normalizer {
    pub fn new(timestamps: TimestampParser) -> Self {
        Self { timestamps }
    }

    pub fn timestamps(&self) -> &TimestampParser {
        &self.timestamps
    }

    fn stamp(&self, record: &Record) -> Result<(i64, String)> {
        let raw = first_text(record, fields::DATE)
            .ok_or_else(|| Error::validation("missing date"))?;
        let parsed = self.timestamps.parse(&raw)?;
        Ok((parsed.millis, parsed.day))
    }

    /// Convert a historical batch of `metric`.
    pub fn history(&self, metric: Metric, data: &DecodedValue) -> Batch<TypedSample> {
        match metric {
            Metric::HeartRate => self.heart_rate_history(data).map(TypedSample::from),
            Metric::BloodOxygen => self.blood_oxygen_history(data).map(TypedSample::from),
            Metric::BloodPressure => self.blood_pressure_history(data).map(TypedSample::from),
            Metric::Temperature => self.temperature_history(data).map(TypedSample::from),
            Metric::Steps => self.step_history(data).map(TypedSample::from),
            Metric::Sleep => self.sleep_history(data).map(TypedSample::from),
        }
    }

    pub fn heart_rate_history(&self, data: &DecodedValue) -> Batch<HeartRateSample> {
        Batch::from_records(data, |record| {
            let (timestamp_millis, day) = self.stamp(record)?;
            let bpm = required_positive(record, fields::HEART_RATE_HISTORY, "heart rate")?;
            Ok(vec![HeartRateSample {
                timestamp_millis,
                day,
                bpm: to_u16(bpm, "heart rate")?,
            }])
        })
    }

    pub fn blood_oxygen_history(&self, data: &DecodedValue) -> Batch<BloodOxygenSample> {
        Batch::from_records(data, |record| {
            let (timestamp_millis, day) = self.stamp(record)?;
            let percent = required_positive(record, fields::BLOOD_OXYGEN, "blood oxygen")?;
            if percent > 100.0 {
                return Err(Error::validation(format!(
                    "blood oxygen above 100%: {percent}"
                )));
            }
            Ok(vec![BloodOxygenSample {
                timestamp_millis,
                day,
                percent: percent as u8,
            }])
        })
    }

    /// Blood pressure needs both systolic and diastolic above zero. The
    /// accompanying pulse defaults to 0.
    pub fn blood_pressure_history(&self, data: &DecodedValue) -> Batch<BloodPressureSample> {
        Batch::from_records(data, |record| {
            let systolic = required_positive(record, fields::SYSTOLIC, "systolic pressure")?;
            let diastolic = required_positive(record, fields::DIASTOLIC, "diastolic pressure")?;
            let (timestamp_millis, day) = self.stamp(record)?;
            let pulse = first_number(record, fields::PULSE).unwrap_or(0.0).max(0.0);
            Ok(vec![BloodPressureSample {
                timestamp_millis,
                day,
                systolic: to_u16(systolic, "systolic pressure")?,
                diastolic: to_u16(diastolic, "diastolic pressure")?,
                heart_rate: to_u16(pulse, "pulse")?,
            }])
        })
    }

    pub fn temperature_history(&self, data: &DecodedValue) -> Batch<TemperatureSample> {
        Batch::from_records(data, |record| {
            let (timestamp_millis, day) = self.stamp(record)?;
            let celsius = required_positive(record, fields::TEMPERATURE_HISTORY, "temperature")?;
            Ok(vec![TemperatureSample {
                timestamp_millis,
                day,
                celsius: celsius as f32,
            }])
        })
    }

    /// Step totals. Missing counters read as zero; the date may be date-only.
    pub fn step_history(&self, data: &DecodedValue) -> Batch<StepSample> {
        Batch::from_records(data, |record| {
            let (timestamp_millis, day) = self.stamp(record)?;
            let steps = first_number(record, fields::STEPS).unwrap_or(0.0);
            if steps < 0.0 || steps > f64::from(u32::MAX) {
                return Err(Error::validation(format!("step count out of range: {steps}")));
            }
            Ok(vec![StepSample {
                timestamp_millis,
                day,
                steps: steps as u32,
                distance: first_number(record, fields::DISTANCE).unwrap_or(0.0).max(0.0) as f32,
                calories: first_number(record, fields::CALORIES).unwrap_or(0.0).max(0.0) as f32,
            }])
        })
    }

    /// Sleep records expand into one sample per code.
    ///
    /// Codes are whitespace separated and start at the record's anchor time;
    /// each code covers `sleepUnitLength` minutes (1 when absent). Tokens
    /// that are not numbers leave a gap but still advance the clock.
    pub fn sleep_history(&self, data: &DecodedValue) -> Batch<SleepStageSample> {
        Batch::from_records(data, |record| {
            let (anchor, day) = self.stamp(record)?;
            let unit = first_number(record, fields::SLEEP_UNIT).map_or(1, |v| v.trunc() as i64);
            if !(1..=MAX_SLEEP_UNIT_MINUTES).contains(&unit) {
                return Err(Error::validation(format!("invalid sleep unit length: {unit}")));
            }
            let unit_minutes = unit as u16;
            let codes = first_text(record, fields::SLEEP_CODES)
                .ok_or_else(|| Error::validation("missing sleep quality codes"))?;

            let step_millis = unit * 60_000;
            let samples = codes
                .split_whitespace()
                .enumerate()
                .filter_map(|(slot, token)| {
                    let code = token.parse::<f32>().ok().filter(|c| c.is_finite())?;
                    Some(SleepStageSample {
                        timestamp_millis: anchor + slot as i64 * step_millis,
                        day: day.clone(),
                        code,
                        stage: SleepStage::from_code(code, unit_minutes),
                        unit_minutes,
                    })
                })
                .collect::<Vec<_>>();
            if samples.is_empty() {
                return Err(Error::validation("sleep record has no usable codes"));
            }
            Ok(samples)
        })
    }

    /// Convert a live telemetry payload received at `received_at`.
    pub fn live(&self, data: &DecodedValue, received_at: OffsetDateTime) -> LiveSnapshot {
        let Some(record) = data.records().into_iter().next() else {
            return LiveSnapshot::default();
        };
        let at = received_at.to_offset(self.timestamps.offset());
        let timestamp_millis = (at.unix_timestamp_nanos() / 1_000_000) as i64;
        let day = calendar_day(at);

        let heart_rate = first_positive(record, fields::HEART_RATE_LIVE)
            .and_then(|bpm| to_u16(bpm, "heart rate").ok())
            .map(|bpm| HeartRateSample {
                timestamp_millis,
                day: day.clone(),
                bpm,
            });

        let blood_oxygen = first_positive(record, fields::BLOOD_OXYGEN)
            .filter(|percent| *percent <= 100.0)
            .map(|percent| BloodOxygenSample {
                timestamp_millis,
                day: day.clone(),
                percent: percent as u8,
            });

        let temperature =
            first_positive(record, fields::TEMPERATURE_LIVE).map(|celsius| TemperatureSample {
                timestamp_millis,
                day: day.clone(),
                celsius: celsius as f32,
            });

        let steps = first_positive(record, fields::STEPS).unwrap_or(0.0);
        let distance = first_positive(record, fields::DISTANCE).unwrap_or(0.0);
        let calories = first_positive(record, fields::CALORIES).unwrap_or(0.0);
        let steps = (steps > 0.0 || distance > 0.0 || calories > 0.0).then(|| StepSample {
            timestamp_millis,
            day: day.clone(),
            steps: steps.min(f64::from(u32::MAX)) as u32,
            distance: distance as f32,
            calories: calories as f32,
        });

        let blood_pressure = match (
            first_positive(record, fields::SYSTOLIC),
            first_positive(record, fields::DIASTOLIC),
        ) {
            (Some(systolic), Some(diastolic)) => Some(BloodPressureSample {
                timestamp_millis,
                day,
                systolic: to_u16(systolic, "systolic pressure").unwrap_or(u16::MAX),
                diastolic: to_u16(diastolic, "diastolic pressure").unwrap_or(u16::MAX),
                heart_rate: heart_rate.as_ref().map_or(0, |hr| hr.bpm),
            }),
            _ => None,
        };

        LiveSnapshot {
            heart_rate,
            blood_oxygen,
            blood_pressure,
            temperature,
            steps,
        }
    }

    /// Battery level from a battery frame payload.
    pub fn battery(data: &DecodedValue) -> Result<BatteryLevel> {
        let raw = data
            .as_record()
            .and_then(|record| fields::BATTERY.iter().find_map(|key| record.get(*key)))
            .unwrap_or(data)
            .as_i64()
            .ok_or_else(|| Error::validation("battery frame without a numeric level"))?;
        BatteryLevel::from_raw(raw)
            .ok_or_else(|| Error::validation(format!("battery level out of range: {raw}")))
    }

    /// Text payload of an informational frame (firmware version, MAC address).
    ///
    /// The payload may be the text itself or a record holding it under one of `keys`.
    pub fn info_text(data: &DecodedValue, keys: &[&str]) -> Option<String> {
        match data {
            DecodedValue::Map(record) => first_text(record, keys).map(|t| t.trim().to_string()),
            other => other
                .as_text()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }
}
