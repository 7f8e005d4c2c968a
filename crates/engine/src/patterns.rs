// crates/engine/src/patterns.rs
//! Usage pattern detection over an aggregated period series: peak hours,
//! peak weekdays, trend, and statistical anomalies.

use crate::aggregation::AggregatedData;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokenwatch_core::UsageEntry;

/// Direction of the token-volume series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A period whose token volume deviates sharply from the series mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub expected: f64,
    pub severity: Severity,
}

/// Derived usage habits over a rollup series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePattern {
    /// Hours of day (configured timezone) carrying the most tokens.
    pub peak_hours: Vec<u32>,
    /// Weekday names with above-average token volume.
    pub peak_days: Vec<String>,
    pub trend: Trend,
    pub anomalies: Vec<Anomaly>,
}

impl UsagePattern {
    /// The pattern reported when the series is too short to analyze.
    pub fn empty() -> Self {
        Self {
            peak_hours: Vec::new(),
            peak_days: Vec::new(),
            trend: Trend::Stable,
            anomalies: Vec::new(),
        }
    }
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Detect patterns over a rollup series.
///
/// Requires at least 7 periods; shorter series produce
/// [`UsagePattern::empty`]. Peak hours come from the raw entry set (the
/// rollups have already collapsed hour-of-day information).
pub fn detect_patterns(
    periods: &[AggregatedData],
    entries: &[UsageEntry],
    tz: Tz,
) -> UsagePattern {
    if periods.len() < 7 {
        return UsagePattern::empty();
    }
    UsagePattern {
        peak_hours: peak_hours(entries, tz),
        peak_days: peak_days(periods, tz),
        trend: trend_of(periods),
        anomalies: detect_anomalies(periods),
    }
}

/// Hours of day ranked by token volume; the top quarter (at least one) of
/// the hours that saw traffic.
pub fn peak_hours(entries: &[UsageEntry], tz: Tz) -> Vec<u32> {
    let mut buckets: HashMap<u32, u64> = HashMap::new();
    for entry in entries {
        let hour = entry.timestamp.with_timezone(&tz).hour();
        *buckets.entry(hour).or_insert(0) += entry.total_tokens();
    }
    let mut ranked: Vec<(u32, u64)> = buckets.into_iter().filter(|(_, t)| *t > 0).collect();
    if ranked.is_empty() {
        return Vec::new();
    }
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let take = ranked.len().div_ceil(4).max(1);
    ranked.into_iter().take(take).map(|(hour, _)| hour).collect()
}

/// Weekday names whose average token volume is strictly above the overall
/// weekday average.
pub fn peak_days(periods: &[AggregatedData], tz: Tz) -> Vec<String> {
    let mut by_weekday: HashMap<Weekday, u64> = HashMap::new();
    for period in periods {
        let weekday = period.period.start.with_timezone(&tz).weekday();
        *by_weekday.entry(weekday).or_insert(0) += period.tokens.total;
    }
    if by_weekday.is_empty() {
        return Vec::new();
    }
    let average =
        by_weekday.values().sum::<u64>() as f64 / by_weekday.len() as f64;
    let mut days: Vec<(Weekday, u64)> = by_weekday
        .into_iter()
        .filter(|(_, tokens)| *tokens as f64 > average)
        .collect();
    days.sort_by(|a, b| b.1.cmp(&a.1));
    days.into_iter()
        .map(|(weekday, _)| weekday_name(weekday).to_string())
        .collect()
}

/// Least-squares slope over `(index, total_tokens)`, classified with a
/// ±0.1 threshold.
pub fn trend_of(periods: &[AggregatedData]) -> Trend {
    let n = periods.len();
    if n < 2 {
        return Trend::Stable;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = periods.iter().map(|p| p.tokens.total as f64).sum::<f64>() / n_f;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, period) in periods.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (period.tokens.total as f64 - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        return Trend::Stable;
    }
    let slope = numerator / denominator;
    if slope > 0.1 {
        Trend::Up
    } else if slope < -0.1 {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Periods whose token volume deviates more than two sample standard
/// deviations from the series mean. Needs at least 5 periods.
pub fn detect_anomalies(periods: &[AggregatedData]) -> Vec<Anomaly> {
    let n = periods.len();
    if n < 5 {
        return Vec::new();
    }
    let values: Vec<f64> = periods.iter().map(|p| p.tokens.total as f64).collect();
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return Vec::new();
    }

    periods
        .iter()
        .zip(values.iter())
        .filter_map(|(period, value)| {
            let z = (value - mean) / stddev;
            if z.abs() <= 2.0 {
                return None;
            }
            let severity = if z.abs() > 3.0 {
                Severity::Critical
            } else if z.abs() > 2.5 {
                Severity::High
            } else {
                Severity::Medium
            };
            Some(Anomaly {
                timestamp: period.period.start,
                value: *value,
                expected: mean,
                severity,
            })
        })
        .collect()
}
