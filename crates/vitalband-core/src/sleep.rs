//! Nightly sleep summaries.

use vitalband_types::{
    BloodOxygenSample, DEFAULT_SLEEP_GOAL_MINUTES, HeartRateSample, Metric, SleepRating,
    SleepStage, SleepStageSample, SleepSummary, TypedSample, canonical_day,
};

use crate::error::Result;
use crate::traits::SampleStore;

fn percent_of(part: u32, whole: u32) -> u8 {
    if whole == 0 {
        0
    } else {
        ((f64::from(part) * 100.0 / f64::from(whole)).round() as u32).min(100) as u8
    }
}

/// Summarize one night.
///
/// Heart-rate and SpO2 samples outside the sleep window are ignored.
/// Returns `None` when there are no stages.
pub fn summarize(
    day: &str,
    mut stages: Vec<SleepStageSample>,
    heart_rate: Vec<HeartRateSample>,
    blood_oxygen: Vec<BloodOxygenSample>,
    goal_minutes: u32,
) -> Option<SleepSummary> {
    stages.sort_by_key(|s| s.timestamp_millis);
    let first = stages.first()?;
    let last = stages.last()?;
    let start_millis = first.timestamp_millis;
    let end_millis = last.timestamp_millis + i64::from(last.unit_minutes) * 60_000;

    let (mut deep, mut light, mut rem, mut awake) = (0u32, 0u32, 0u32, 0u32);
    for stage in &stages {
        let minutes = u32::from(stage.unit_minutes);
        match stage.stage {
            SleepStage::Deep => deep += minutes,
            SleepStage::Light => light += minutes,
            SleepStage::Rem => rem += minutes,
            SleepStage::Awake => awake += minutes,
        }
    }
    let total_sleep_minutes = deep + light + rem;
    let in_bed_minutes = total_sleep_minutes + awake;

    let latency_minutes = stages
        .iter()
        .find(|s| s.stage.is_asleep())
        .map_or(in_bed_minutes, |s| {
            ((s.timestamp_millis - start_millis) / 60_000).max(0) as u32
        });

    let efficiency_percent = percent_of(total_sleep_minutes, in_bed_minutes);
    let goal_share = if goal_minutes == 0 {
        1.0
    } else {
        (f64::from(total_sleep_minutes) / f64::from(goal_minutes)).min(1.0)
    };
    let score = (goal_share * f64::from(efficiency_percent)).round().clamp(0.0, 100.0) as u8;

    let in_window = |ts: i64| ts >= start_millis && ts < end_millis;
    let mut heart_rate: Vec<_> = heart_rate
        .into_iter()
        .filter(|s| in_window(s.timestamp_millis))
        .collect();
    heart_rate.sort_by_key(|s| s.timestamp_millis);
    let mut blood_oxygen: Vec<_> = blood_oxygen
        .into_iter()
        .filter(|s| in_window(s.timestamp_millis))
        .collect();
    blood_oxygen.sort_by_key(|s| s.timestamp_millis);

    Some(SleepSummary {
        day: day.to_string(),
        score,
        rating: SleepRating::from_score(score),
        total_sleep_minutes,
        in_bed_minutes,
        deep_minutes: deep,
        light_minutes: light,
        rem_minutes: rem,
        awake_minutes: awake,
        deep_percent: percent_of(deep, in_bed_minutes),
        light_percent: percent_of(light, in_bed_minutes),
        rem_percent: percent_of(rem, in_bed_minutes),
        awake_percent: percent_of(awake, in_bed_minutes),
        efficiency_percent,
        latency_minutes,
        debt_minutes: goal_minutes.saturating_sub(total_sleep_minutes),
        start_millis,
        end_millis,
        stages,
        heart_rate,
        blood_oxygen,
    })
}

/// Load the night filed under `day` from `store` and summarize it against
/// the default eight-hour goal.
///
/// `day` may use dots or hyphens.
pub async fn load_summary(store: &dyn SampleStore, day: &str) -> Result<Option<SleepSummary>> {
    let day = canonical_day(day)?;
    let stages: Vec<_> = store
        .by_day(Metric::Sleep, &day)
        .await?
        .into_iter()
        .filter_map(|sample| match sample {
            TypedSample::Sleep(stage) => Some(stage),
            _ => None,
        })
        .collect();
    let Some((start, end)) = window(&stages) else {
        return Ok(None);
    };

    let heart_rate = store
        .range(Metric::HeartRate, start, end)
        .await?
        .into_iter()
        .filter_map(|sample| match sample {
            TypedSample::HeartRate(hr) => Some(hr),
            _ => None,
        })
        .collect();
    let blood_oxygen = store
        .range(Metric::BloodOxygen, start, end)
        .await?
        .into_iter()
        .filter_map(|sample| match sample {
            TypedSample::BloodOxygen(spo2) => Some(spo2),
            _ => None,
        })
        .collect();

    Ok(summarize(
        &day,
        stages,
        heart_rate,
        blood_oxygen,
        DEFAULT_SLEEP_GOAL_MINUTES,
    ))
}

fn window(stages: &[SleepStageSample]) -> Option<(i64, i64)> {
    let start = stages.iter().map(|s| s.timestamp_millis).min()?;
    let end = stages
        .iter()
        .map(|s| s.timestamp_millis + i64::from(s.unit_minutes) * 60_000)
        .max()?;
    Some((start, end))
}
