// crates/engine/src/realtime.rs
//! Real-time metrics for the active billing session.
//!
//! The calculator keeps a rolling window of recent entries (pruned on every
//! ingest) and a TTL-cached snapshot so that render-rate callers do not
//! recompute. Reads take shared access; ingest, reset, and recompute take
//! the write lock. The lock is `std::sync::RwLock`: it is never held across
//! an await point and reads are uncontended between recomputes.

use crate::config::MonitorConfig;
use crate::extended::{
    efficiency_metrics, health_metrics, performance_metrics, trend_metrics, EfficiencyMetrics,
    HealthMetrics, PerformanceMetrics, TrendMetrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Instant;
use tokenwatch_core::{duration_nanos, UsageEntry};
use tracing::debug;

/// Per-model share of the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDistribution {
    pub tokens: u64,
    pub cost: f64,
    /// Share of the session's tokens, 0–100.
    pub percentage: f64,
    pub last_used: DateTime<Utc>,
}

/// Immutable snapshot of the active session's live metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMetrics {
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub current_tokens: u64,
    pub current_cost: f64,
    /// Share of the session window elapsed, 0–100.
    pub progress_percent: f64,
    #[serde(with = "duration_nanos")]
    pub time_remaining: Duration,
    pub tokens_per_minute: f64,
    pub tokens_per_hour: f64,
    pub cost_per_minute: f64,
    pub cost_per_hour: f64,
    /// Tokens per minute over the trailing hour.
    pub burn_rate: f64,
    pub projected_tokens: u64,
    pub projected_cost: f64,
    /// When the plan's cost budget runs out at the current spend rate;
    /// absent without a configured limit or with no spend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_end_time: Option<DateTime<Utc>>,
    /// How trustworthy the projections are, 0–100.
    pub confidence_level: f64,
    pub model_distribution: HashMap<String, ModelDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<EfficiencyMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendMetrics>,
}

struct CachedSnapshot {
    computed_at: Instant,
    snapshot: std::sync::Arc<RealtimeMetrics>,
}

struct Inner {
    session_start: DateTime<Utc>,
    entries: VecDeque<UsageEntry>,
    cached: Option<CachedSnapshot>,
}

/// Stateful calculator for the single active session.
pub struct RealtimeCalculator {
    window: Duration,
    update_interval: std::time::Duration,
    cost_limit: Option<f64>,
    inner: RwLock<Inner>,
}

impl RealtimeCalculator {
    pub fn new(config: &MonitorConfig, session_start: DateTime<Utc>) -> Self {
        let cost_limit = config
            .plan
            .default_cost_limit()
            .or(config.custom_cost_limit);
        Self {
            window: config.session_window,
            update_interval: config.update_interval,
            cost_limit,
            inner: RwLock::new(Inner {
                session_start,
                entries: VecDeque::new(),
                cached: None,
            }),
        }
    }

    /// Append an entry, prune everything older than the rolling window, and
    /// invalidate the cached snapshot.
    pub fn update_with_new_entry(&self, entry: UsageEntry) {
        self.update_with_new_entry_at(entry, Utc::now());
    }

    pub fn update_with_new_entry_at(&self, entry: UsageEntry, now: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("realtime state poisoned");
        inner.entries.push_back(entry);
        let cutoff = now - self.window;
        while inner
            .entries
            .front()
            .map(|e| e.timestamp < cutoff)
            .unwrap_or(false)
        {
            inner.entries.pop_front();
        }
        inner.cached = None;
    }

    /// Current metrics snapshot, recomputed at most once per update
    /// interval.
    pub fn calculate(&self) -> std::sync::Arc<RealtimeMetrics> {
        self.calculate_at(Utc::now())
    }

    pub fn calculate_at(&self, now: DateTime<Utc>) -> std::sync::Arc<RealtimeMetrics> {
        {
            let inner = self.inner.read().expect("realtime state poisoned");
            if let Some(cached) = &inner.cached {
                if cached.computed_at.elapsed() < self.update_interval {
                    return std::sync::Arc::clone(&cached.snapshot);
                }
            }
        }

        let mut inner = self.inner.write().expect("realtime state poisoned");
        if let Some(cached) = &inner.cached {
            if cached.computed_at.elapsed() < self.update_interval {
                return std::sync::Arc::clone(&cached.snapshot);
            }
        }
        let snapshot = std::sync::Arc::new(self.compute(&inner, now));
        debug!(
            tokens = snapshot.current_tokens,
            cost = snapshot.current_cost,
            "recomputed realtime metrics"
        );
        inner.cached = Some(CachedSnapshot {
            computed_at: Instant::now(),
            snapshot: std::sync::Arc::clone(&snapshot),
        });
        snapshot
    }

    /// Tokens per minute over the trailing `duration`.
    pub fn burn_rate_for(&self, duration: Duration) -> f64 {
        self.burn_rate_for_at(duration, Utc::now())
    }

    pub fn burn_rate_for_at(&self, duration: Duration, now: DateTime<Utc>) -> f64 {
        let minutes = duration.num_seconds() as f64 / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        let inner = self.inner.read().expect("realtime state poisoned");
        let cutoff = now - duration;
        let tokens: u64 = inner
            .entries
            .iter()
            .filter(|e| e.timestamp > cutoff && e.timestamp <= now)
            .map(UsageEntry::total_tokens)
            .sum();
        tokens as f64 / minutes
    }

    /// Drop only the cached snapshot; the rolling window is untouched.
    pub fn clear_cache(&self) {
        self.inner.write().expect("realtime state poisoned").cached = None;
    }

    /// Drop all window state and restart the session at `new_session_start`.
    pub fn reset(&self, new_session_start: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("realtime state poisoned");
        inner.session_start = new_session_start;
        inner.entries.clear();
        inner.cached = None;
    }

    /// Number of entries currently retained in the rolling window.
    pub fn window_len(&self) -> usize {
        self.inner.read().expect("realtime state poisoned").entries.len()
    }

    fn compute(&self, inner: &Inner, now: DateTime<Utc>) -> RealtimeMetrics {
        let entries: Vec<UsageEntry> = inner.entries.iter().cloned().collect();
        let session_start = inner.session_start;
        let session_end = session_start + self.window;

        let current_tokens: u64 = entries.iter().map(UsageEntry::total_tokens).sum();
        let current_cost: f64 = entries.iter().map(|e| e.cost_usd).sum();

        let elapsed = (now - session_start).max(Duration::zero());
        let elapsed_minutes = elapsed.num_seconds() as f64 / 60.0;
        let window_minutes = self.window.num_seconds() as f64 / 60.0;
        let progress_percent = if window_minutes > 0.0 {
            (elapsed_minutes / window_minutes * 100.0).min(100.0)
        } else {
            0.0
        };
        let time_remaining = (self.window - elapsed).max(Duration::zero());

        let hour_cutoff = now - Duration::hours(1);
        let minute_cutoff = now - Duration::minutes(1);
        let in_range = |e: &&UsageEntry, cutoff: DateTime<Utc>| {
            e.timestamp > cutoff && e.timestamp <= now
        };
        let hour_tokens: u64 = entries
            .iter()
            .filter(|e| in_range(e, hour_cutoff))
            .map(UsageEntry::total_tokens)
            .sum();
        let hour_cost: f64 = entries
            .iter()
            .filter(|e| in_range(e, hour_cutoff))
            .map(|e| e.cost_usd)
            .sum();
        let hour_empty = !entries.iter().any(|e| in_range(&e, hour_cutoff));

        let (tokens_per_minute, tokens_per_hour, cost_per_minute, cost_per_hour, burn_rate) =
            if !hour_empty {
                let minute_tokens: u64 = entries
                    .iter()
                    .filter(|e| in_range(e, minute_cutoff))
                    .map(UsageEntry::total_tokens)
                    .sum();
                let minute_cost: f64 = entries
                    .iter()
                    .filter(|e| in_range(e, minute_cutoff))
                    .map(|e| e.cost_usd)
                    .sum();
                // The hourly figures are extrapolated when the session is
                // younger than one hour.
                let scale = (elapsed_minutes / 60.0).min(1.0);
                let (tph, cph) = if scale > 0.0 {
                    (hour_tokens as f64 / scale, hour_cost / scale)
                } else {
                    (0.0, 0.0)
                };
                (
                    minute_tokens as f64,
                    tph,
                    minute_cost,
                    cph,
                    hour_tokens as f64 / 60.0,
                )
            } else if !entries.is_empty() && elapsed_minutes > 0.0 {
                // Quiet last hour: fall back to session averages.
                let tpm = current_tokens as f64 / elapsed_minutes;
                let cpm = current_cost / elapsed_minutes;
                (tpm, tpm * 60.0, cpm, cpm * 60.0, tpm)
            } else {
                (0.0, 0.0, 0.0, 0.0, 0.0)
            };

        let remaining_minutes = time_remaining.num_seconds() as f64 / 60.0;
        let projected_tokens =
            current_tokens + (tokens_per_minute * remaining_minutes).round() as u64;
        let projected_cost = current_cost + cost_per_minute * remaining_minutes;

        let predicted_end_time = self.cost_limit.and_then(|limit| {
            if cost_per_minute <= 0.0 {
                return None;
            }
            let remaining_budget = limit - current_cost;
            if remaining_budget <= 0.0 {
                return Some(now);
            }
            let minutes_left = remaining_budget / cost_per_minute;
            Some(now + Duration::seconds((minutes_left * 60.0) as i64))
        });

        let data_confidence = ((entries.len() as f64 / 10.0) * 100.0).min(100.0);
        let time_confidence = ((elapsed_minutes / 60.0) * 100.0).min(100.0);
        let confidence_level = ((data_confidence + time_confidence) / 2.0).min(100.0);

        let mut model_distribution: HashMap<String, ModelDistribution> = HashMap::new();
        for entry in &entries {
            let dist = model_distribution
                .entry(entry.model.clone())
                .or_insert_with(|| ModelDistribution {
                    tokens: 0,
                    cost: 0.0,
                    percentage: 0.0,
                    last_used: entry.timestamp,
                });
            dist.tokens += entry.total_tokens();
            dist.cost += entry.cost_usd;
            dist.last_used = dist.last_used.max(entry.timestamp);
        }
        if current_tokens > 0 {
            for dist in model_distribution.values_mut() {
                dist.percentage = dist.tokens as f64 / current_tokens as f64 * 100.0;
            }
        }

        RealtimeMetrics {
            session_start,
            session_end,
            current_tokens,
            current_cost,
            progress_percent,
            time_remaining,
            tokens_per_minute,
            tokens_per_hour,
            cost_per_minute,
            cost_per_hour,
            burn_rate,
            projected_tokens,
            projected_cost,
            predicted_end_time,
            confidence_level,
            model_distribution,
            performance: performance_metrics(&entries),
            efficiency: efficiency_metrics(&entries),
            health: health_metrics(&entries, session_start, self.window, now),
            trend: trend_metrics(&entries),
        }
    }
}
