// crates/engine/src/extended.rs
//! Advisory metric groups derived from the rolling entry window.
//!
//! These are heuristics for dashboard color, not billing data: consumers
//! must tolerate their absence. Each derivation returns `None` when the
//! window holds fewer than two entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokenwatch_core::UsageEntry;

/// Throughput heuristics. Latency is simulated from output token volume
/// (no wire timings are available in the log data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub avg_output_tokens: f64,
    pub estimated_latency_ms: f64,
    pub throughput_tokens_per_sec: f64,
}

/// Cache economics over the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyMetrics {
    /// Cache reads as a share of all cache traffic, 0–100.
    pub cache_hit_rate: f64,
    /// Cache reads as a share of all tokens, 0–100.
    pub cache_share: f64,
    pub output_input_ratio: f64,
}

/// Session liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub status: HealthStatus,
    pub seconds_since_last_entry: i64,
    /// Share of the session window already elapsed, 0–100.
    pub window_fill_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Idle,
    Stale,
}

/// First-half vs second-half movement of the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendMetrics {
    pub tokens_change_percent: f64,
    pub cost_change_percent: f64,
}

pub fn performance_metrics(entries: &[UsageEntry]) -> Option<PerformanceMetrics> {
    if entries.len() < 2 {
        return None;
    }
    let total_output: u64 = entries.iter().map(|e| e.output_tokens).sum();
    let avg_output_tokens = total_output as f64 / entries.len() as f64;
    // Rough generation-speed model: ~50 output tokens per second.
    let estimated_latency_ms = avg_output_tokens / 50.0 * 1000.0;

    let span_secs = (entries.last()?.timestamp - entries.first()?.timestamp).num_seconds();
    let throughput_tokens_per_sec = if span_secs > 0 {
        entries.iter().map(UsageEntry::total_tokens).sum::<u64>() as f64 / span_secs as f64
    } else {
        0.0
    };
    Some(PerformanceMetrics {
        avg_output_tokens,
        estimated_latency_ms,
        throughput_tokens_per_sec,
    })
}

pub fn efficiency_metrics(entries: &[UsageEntry]) -> Option<EfficiencyMetrics> {
    if entries.len() < 2 {
        return None;
    }
    let reads: u64 = entries.iter().map(|e| e.cache_read_tokens).sum();
    let creations: u64 = entries.iter().map(|e| e.cache_creation_tokens).sum();
    let inputs: u64 = entries.iter().map(|e| e.input_tokens).sum();
    let outputs: u64 = entries.iter().map(|e| e.output_tokens).sum();
    let total: u64 = entries.iter().map(UsageEntry::total_tokens).sum();

    let cache_traffic = reads + creations;
    let cache_hit_rate = if cache_traffic > 0 {
        reads as f64 / cache_traffic as f64 * 100.0
    } else {
        0.0
    };
    let cache_share = if total > 0 {
        reads as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let output_input_ratio = if inputs > 0 {
        outputs as f64 / inputs as f64
    } else {
        0.0
    };
    Some(EfficiencyMetrics {
        cache_hit_rate,
        cache_share,
        output_input_ratio,
    })
}

pub fn health_metrics(
    entries: &[UsageEntry],
    session_start: DateTime<Utc>,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<HealthMetrics> {
    let last = entries.last()?;
    let seconds_since_last_entry = (now - last.timestamp).num_seconds().max(0);
    let status = if seconds_since_last_entry < 120 {
        HealthStatus::Ok
    } else if seconds_since_last_entry < 900 {
        HealthStatus::Idle
    } else {
        HealthStatus::Stale
    };
    let window_secs = window.num_seconds().max(1);
    let elapsed = (now - session_start).num_seconds().clamp(0, window_secs);
    Some(HealthMetrics {
        status,
        seconds_since_last_entry,
        window_fill_percent: elapsed as f64 / window_secs as f64 * 100.0,
    })
}

pub fn trend_metrics(entries: &[UsageEntry]) -> Option<TrendMetrics> {
    if entries.len() < 2 {
        return None;
    }
    let mid = entries.len() / 2;
    let (first, second) = entries.split_at(mid);

    let change = |a: f64, b: f64| -> f64 {
        if a > 0.0 {
            (b - a) / a * 100.0
        } else {
            0.0
        }
    };
    let first_tokens: u64 = first.iter().map(UsageEntry::total_tokens).sum();
    let second_tokens: u64 = second.iter().map(UsageEntry::total_tokens).sum();
    let first_cost: f64 = first.iter().map(|e| e.cost_usd).sum();
    let second_cost: f64 = second.iter().map(|e| e.cost_usd).sum();
    Some(TrendMetrics {
        tokens_change_percent: change(first_tokens as f64, second_tokens as f64),
        cost_change_percent: change(first_cost, second_cost),
    })
}
