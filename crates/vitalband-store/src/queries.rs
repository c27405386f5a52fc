//! Query builder for stored samples.

use vitalband_types::Metric;

/// Fluent query over one metric's table.
///
/// By default results are ordered newest first. Time bounds are epoch
/// milliseconds; `since` is inclusive and `until` exclusive.
///
/// # Example
///
/// ```
/// use vitalband_store::SampleQuery;
/// use vitalband_types::Metric;
///
/// // The fifty newest heart-rate samples of one night
/// let query = SampleQuery::new(Metric::HeartRate)
///     .day("2024.03.01")
///     .limit(50);
///
/// // Everything in a window, chronologically
/// let window = SampleQuery::new(Metric::BloodOxygen)
///     .since(1_709_250_000_000)
///     .until(1_709_280_000_000)
///     .oldest_first();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SampleQuery {
    pub metric: Metric,
    pub since: Option<i64>,
    pub until: Option<i64>,
    /// Only samples filed under this `yyyy.MM.dd` day.
    pub day: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub newest_first: bool,
}

impl SampleQuery {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            since: None,
            until: None,
            day: None,
            limit: None,
            offset: None,
            newest_first: true,
        }
    }

    #[must_use]
    pub fn since(mut self, millis: i64) -> Self {
        self.since = Some(millis);
        self
    }

    #[must_use]
    pub fn until(mut self, millis: i64) -> Self {
        self.until = Some(millis);
        self
    }

    #[must_use]
    pub fn day(mut self, day: impl Into<String>) -> Self {
        self.day = Some(day.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results. Use with `limit()` for pagination.
    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(since) = self.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(since));
        }

        if let Some(until) = self.until {
            conditions.push("timestamp < ?");
            params.push(Box::new(until));
        }

        if let Some(ref day) = self.day {
            conditions.push("day = ?");
            params.push(Box::new(day.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    pub(crate) fn build_sql(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let (where_clause, params) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT {} FROM {} {} ORDER BY timestamp {}",
            columns(self.metric),
            self.metric.as_str(),
            where_clause,
            order
        );

        // SQLite needs a LIMIT before an OFFSET.
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        (sql, params)
    }
}

/// Column list of a metric's table, in row-mapping order.
pub(crate) fn columns(metric: Metric) -> &'static str {
    match metric {
        Metric::HeartRate => "timestamp, day, bpm",
        Metric::BloodOxygen => "timestamp, day, percent",
        Metric::BloodPressure => "timestamp, day, systolic, diastolic, heart_rate",
        Metric::Temperature => "timestamp, day, celsius",
        Metric::Steps => "timestamp, day, steps, distance, calories",
        Metric::Sleep => "timestamp, day, code, stage, unit_minutes",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query_is_newest_first_without_filters() {
        let (sql, params) = SampleQuery::new(Metric::HeartRate).build_sql();
        assert_eq!(
            sql.trim(),
            "SELECT timestamp, day, bpm FROM heart_rate  ORDER BY timestamp DESC"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_filters_and_paging() {
        let query = SampleQuery::new(Metric::Sleep)
            .since(10)
            .until(20)
            .day("2024.03.01")
            .limit(5)
            .offset(10)
            .oldest_first();
        let (sql, params) = query.build_sql();
        assert!(sql.contains("FROM sleep WHERE timestamp >= ? AND timestamp < ? AND day = ?"));
        assert!(sql.ends_with("ORDER BY timestamp ASC LIMIT 5 OFFSET 10"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_offset_without_limit() {
        let (sql, _) = SampleQuery::new(Metric::Steps).offset(3).build_sql();
        assert!(sql.ends_with("LIMIT -1 OFFSET 3"));
    }
}
