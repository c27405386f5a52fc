//! Device timestamp parsing.
//!
//! Band firmware writes wall-clock timestamps as text, and the layout has
//! drifted between revisions. Formats are tried in a fixed order and the
//! first that matches wins:
//!
//! 1. `2024.03.01 10:00:00` dotted with space
//! 2. `2024-03-01 10:00:00` hyphenated with space
//! 3. `2024.03.0110:00:00` dotted without space (the space is reinserted)
//! 4. `2024.03.01 100000` no colons (any separators, 12 or 14 digits)
//! 5. `2024.03.01` date only, taken as midnight (step totals)
//!
//! Wall-clock values are interpreted in a configured UTC offset.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time, UtcOffset};

use vitalband_types::calendar_day;

use crate::error::{Error, Result};

const DOTTED: &[BorrowedFormatItem<'static>] =
    format_description!("[year].[month].[day] [hour]:[minute]:[second]");
const HYPHENATED: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DATE_DOTTED: &[BorrowedFormatItem<'static>] = format_description!("[year].[month].[day]");
const DATE_HYPHENATED: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// A timestamp layout the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    DottedWithSpace,
    HyphenatedWithSpace,
    DottedNoSpace,
    NoColon,
    DateOnly,
}

impl TimestampFormat {
    /// Formats in the order they are attempted.
    pub const FALLBACK_ORDER: [TimestampFormat; 5] = [
        TimestampFormat::DottedWithSpace,
        TimestampFormat::HyphenatedWithSpace,
        TimestampFormat::DottedNoSpace,
        TimestampFormat::NoColon,
        TimestampFormat::DateOnly,
    ];

    fn attempt(&self, s: &str) -> Option<PrimitiveDateTime> {
        match self {
            TimestampFormat::DottedWithSpace => PrimitiveDateTime::parse(s, DOTTED).ok(),
            TimestampFormat::HyphenatedWithSpace => PrimitiveDateTime::parse(s, HYPHENATED).ok(),
            TimestampFormat::DottedNoSpace => {
                let spaced = insert_date_time_space(s)?;
                PrimitiveDateTime::parse(&spaced, DOTTED)
                    .or_else(|_| PrimitiveDateTime::parse(&spaced, HYPHENATED))
                    .ok()
            }
            TimestampFormat::NoColon => {
                let rebuilt = rebuild_from_digits(s)?;
                PrimitiveDateTime::parse(&rebuilt, DOTTED).ok()
            }
            TimestampFormat::DateOnly => Date::parse(s, DATE_DOTTED)
                .or_else(|_| Date::parse(s, DATE_HYPHENATED))
                .ok()
                .map(|date| PrimitiveDateTime::new(date, Time::MIDNIGHT)),
        }
    }
}

/// `2024.03.0110:00:00` becomes `2024.03.01 10:00:00`.
fn insert_date_time_space(s: &str) -> Option<String> {
    if !s.is_ascii() || s.len() <= 10 {
        return None;
    }
    let (date, time) = s.split_at(10);
    let bytes = date.as_bytes();
    let sep = bytes[4];
    let date_ok = matches!(sep, b'.' | b'-')
        && bytes[7] == sep
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    let time_ok = time.as_bytes().first().is_some_and(u8::is_ascii_digit);
    (date_ok && time_ok).then(|| format!("{date} {time}"))
}

/// Keep only the digits and rebuild `yyyy.MM.dd HH:mm:ss`.
fn rebuild_from_digits(s: &str) -> Option<String> {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    let seconds = match digits.len() {
        14 => &digits[12..14],
        12 => "00",
        _ => return None,
    };
    Some(format!(
        "{}.{}.{} {}:{}:{}",
        &digits[0..4],
        &digits[4..6],
        &digits[6..8],
        &digits[8..10],
        &digits[10..12],
        seconds
    ))
}

/// A parsed device timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTimestamp {
    pub millis: i64,
    /// Calendar day of the wall-clock value, `yyyy.MM.dd`.
    pub day: String,
    pub format: TimestampFormat,
}

/// Parses device timestamps in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampParser {
    offset: UtcOffset,
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl TimestampParser {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Parse `raw`, trying each format in [`TimestampFormat::FALLBACK_ORDER`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseFallbackExhausted`] when no format matches.
    pub fn parse(&self, raw: &str) -> Result<ParsedTimestamp> {
        let s = raw.trim();
        let exhausted = || Error::ParseFallbackExhausted {
            input: raw.to_string(),
        };
        let (format, wall_clock) = TimestampFormat::FALLBACK_ORDER
            .iter()
            .find_map(|format| format.attempt(s).map(|dt| (*format, dt)))
            .ok_or_else(exhausted)?;
        let at = wall_clock.assume_offset(self.offset);
        let millis = i64::try_from(at.unix_timestamp_nanos() / 1_000_000).map_err(|_| exhausted())?;
        Ok(ParsedTimestamp {
            millis,
            day: calendar_day(at),
            format,
        })
    }

    /// Parse `raw` and return only the epoch milliseconds.
    pub fn parse_millis(&self, raw: &str) -> Result<i64> {
        self.parse(raw).map(|parsed| parsed.millis)
    }
}
