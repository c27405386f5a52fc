//! Nightly sleep summary.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::{BloodOxygenSample, HeartRateSample, SleepStageSample};

/// Default nightly sleep goal, 8 hours.
pub const DEFAULT_SLEEP_GOAL_MINUTES: u32 = 8 * 60;

/// Qualitative rating derived from [`SleepSummary::score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SleepRating {
    Excellent,
    Normal,
    Poor,
}

impl SleepRating {
    /// Rating for a 0-100 score: 80 and above is Excellent, 60 and above Normal.
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => SleepRating::Excellent,
            60..=79 => SleepRating::Normal,
            _ => SleepRating::Poor,
        }
    }
}

impl std::fmt::Display for SleepRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SleepRating::Excellent => write!(f, "Excellent"),
            SleepRating::Normal => write!(f, "Normal"),
            SleepRating::Poor => write!(f, "Poor"),
        }
    }
}

/// Aggregate view of one night of sleep stages.
///
/// Percentages are of in-bed time and are rounded, so they may not add up
/// to exactly 100.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SleepSummary {
    /// Day the night is filed under (`yyyy.MM.dd`).
    pub day: String,
    pub score: u8,
    pub rating: SleepRating,
    /// Minutes in Deep, Light or REM.
    pub total_sleep_minutes: u32,
    /// Minutes covered by any stage, Awake included.
    pub in_bed_minutes: u32,
    pub deep_minutes: u32,
    pub light_minutes: u32,
    pub rem_minutes: u32,
    pub awake_minutes: u32,
    pub deep_percent: u8,
    pub light_percent: u8,
    pub rem_percent: u8,
    pub awake_percent: u8,
    /// Total sleep as a percentage of in-bed time.
    pub efficiency_percent: u8,
    /// Minutes from the first stage to the first non-awake stage.
    pub latency_minutes: u32,
    /// Minutes short of the sleep goal, 0 when the goal was met.
    pub debt_minutes: u32,
    pub start_millis: i64,
    /// End of the last stage slot.
    pub end_millis: i64,
    pub stages: Vec<SleepStageSample>,
    pub heart_rate: Vec<HeartRateSample>,
    pub blood_oxygen: Vec<BloodOxygenSample>,
}
