// crates/engine/src/aggregation.rs
//! Historical aggregation: rolls the entry set into calendar periods in the
//! configured timezone.
//!
//! Grouping keys are `YYYY-MM-DD` (daily), ISO `YYYY-Www` with Monday as
//! the first day (weekly), and `YYYY-MM` (monthly). The range filter is
//! strictly exclusive on both bounds; entries exactly on a bound are
//! excluded.

use crate::cache::AggregationCache;
use crate::error::AggregationError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Calendar granularity of a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl ViewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewType::Daily => "daily",
            ViewType::Weekly => "weekly",
            ViewType::Monthly => "monthly",
            ViewType::Custom => "custom",
        }
    }
}

/// One calendar period of a rollup series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start: DateTime<Utc>,
    /// Inclusive close: period start + length − 1 ns.
    pub end: DateTime<Utc>,
    pub label: String,
    pub view: ViewType,
}

/// Token statistics for one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub total: u64,
    pub input: u64,
    pub output: u64,
    /// Cache-creation plus cache-read tokens.
    pub cache: u64,
    pub average: f64,
    /// Largest single-entry total in the period.
    pub peak: u64,
    pub peak_time: Option<DateTime<Utc>>,
    /// Smallest single-entry total in the period.
    pub min: u64,
}

/// Cost statistics for one period.
///
/// `min` is folded from positive infinity; an empty group reports 0.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostStats {
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub by_model: HashMap<String, f64>,
}

/// Per-model aggregate for one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelAggregate {
    pub entry_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// One period's rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedData {
    pub period: TimePeriod,
    pub entry_count: usize,
    pub tokens: TokenStats,
    pub costs: CostStats,
    pub models: HashMap<String, ModelAggregate>,
}

/// Stateful aggregation engine: timezone plus result cache.
pub struct AggregationEngine {
    tz: Tz,
    cache: AggregationCache,
}

fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Monday of ISO week `week` in ISO year `year`.
fn iso_week_start(year: i32, week: u32) -> Option<NaiveDate> {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
}

impl AggregationEngine {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            cache: AggregationCache::default(),
        }
    }

    pub fn with_cache(tz: Tz, cache: AggregationCache) -> Self {
        Self { tz, cache }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Drop all cached rollups.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Roll entries with `start < timestamp < end` into calendar periods.
    ///
    /// Results are cached under `(view, start, end)`; a live cache slot is
    /// served without recomputation.
    pub fn aggregate(
        &self,
        entries: &[tokenwatch_core::UsageEntry],
        view: ViewType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Arc<Vec<AggregatedData>>, AggregationError> {
        if view == ViewType::Custom {
            return Err(AggregationError::unsupported_view(view.as_str()));
        }

        let key = (view, start, end);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let mut groups: BTreeMap<String, Vec<&tokenwatch_core::UsageEntry>> = BTreeMap::new();
        for entry in entries {
            if entry.timestamp <= start || entry.timestamp >= end {
                continue;
            }
            groups
                .entry(self.period_key(view, entry.timestamp))
                .or_default()
                .push(entry);
        }

        let mut periods: Vec<AggregatedData> = groups
            .into_iter()
            .map(|(label, group)| self.roll_up(view, label, &group))
            .collect();
        periods.sort_by_key(|p| p.period.start);

        let result = Arc::new(periods);
        self.cache.insert(key, Arc::clone(&result));
        Ok(result)
    }

    fn period_key(&self, view: ViewType, timestamp: DateTime<Utc>) -> String {
        let local = timestamp.with_timezone(&self.tz);
        match view {
            ViewType::Daily => local.format("%Y-%m-%d").to_string(),
            ViewType::Weekly => {
                let iso = local.iso_week();
                format!("{:04}-W{:02}", iso.year(), iso.week())
            }
            ViewType::Monthly => local.format("%Y-%m").to_string(),
            ViewType::Custom => unreachable!("custom views are rejected before grouping"),
        }
    }

    fn period_bounds(
        &self,
        view: ViewType,
        timestamp: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let local = timestamp.with_timezone(&self.tz);
        let date = local.date_naive();
        let (start_date, next_date) = match view {
            ViewType::Daily => (date, date + Duration::days(1)),
            ViewType::Weekly => {
                let iso = local.iso_week();
                let monday = iso_week_start(iso.year(), iso.week()).unwrap_or(date);
                (monday, monday + Duration::days(7))
            }
            ViewType::Monthly => {
                let first = date.with_day(1).unwrap_or(date);
                let next = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
                }
                .unwrap_or(first);
                (first, next)
            }
            ViewType::Custom => unreachable!("custom views are rejected before grouping"),
        };
        let start = local_to_utc(
            self.tz,
            start_date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        );
        let next = local_to_utc(
            self.tz,
            next_date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        );
        (start, next - Duration::nanoseconds(1))
    }

    fn roll_up(
        &self,
        view: ViewType,
        label: String,
        group: &[&tokenwatch_core::UsageEntry],
    ) -> AggregatedData {
        let (start, end) = self.period_bounds(view, group[0].timestamp);

        let mut tokens = TokenStats {
            min: u64::MAX,
            ..Default::default()
        };
        let mut costs = CostStats {
            min: f64::INFINITY,
            ..Default::default()
        };
        let mut models: HashMap<String, ModelAggregate> = HashMap::new();

        for entry in group {
            let entry_total = entry.total_tokens();
            tokens.total += entry_total;
            tokens.input += entry.input_tokens;
            tokens.output += entry.output_tokens;
            tokens.cache += entry.cache_creation_tokens + entry.cache_read_tokens;
            if entry_total > tokens.peak {
                tokens.peak = entry_total;
                tokens.peak_time = Some(entry.timestamp);
            }
            tokens.min = tokens.min.min(entry_total);

            costs.total += entry.cost_usd;
            costs.min = costs.min.min(entry.cost_usd);
            costs.max = costs.max.max(entry.cost_usd);
            *costs.by_model.entry(entry.model.clone()).or_insert(0.0) += entry.cost_usd;

            let model = models.entry(entry.model.clone()).or_default();
            model.entry_count += 1;
            model.total_tokens += entry_total;
            model.total_cost += entry.cost_usd;
        }

        let entry_count = group.len();
        tokens.average = tokens.total as f64 / entry_count as f64;
        if tokens.min == u64::MAX {
            tokens.min = 0;
        }
        costs.average = costs.total / entry_count as f64;
        if !costs.min.is_finite() {
            costs.min = 0.0;
        }

        AggregatedData {
            period: TimePeriod {
                start,
                end,
                label,
                view,
            },
            entry_count,
            tokens,
            costs,
            models,
        }
    }
}
