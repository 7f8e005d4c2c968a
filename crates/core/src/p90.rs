// crates/core/src/p90.rs
//! P90 limit inference: 90th-percentile thresholds over historical session
//! blocks, used when a plan has no fixed limit.

use crate::types::SessionBlock;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tuning knobs for the estimator.
#[derive(Debug, Clone)]
pub struct P90Config {
    /// Common per-window token tiers; a block at 95% of any tier counts as
    /// limit-hitting.
    pub common_token_limits: Vec<u64>,
    /// Fraction of a tier that qualifies a block as limit-hitting.
    pub limit_threshold: f64,
    /// Floor (and fallback) for the inferred token limit.
    pub default_min_tokens: u64,
    /// Fallback cost limit when no completed blocks exist.
    pub default_cost: f64,
    /// Fallback message limit when no completed blocks exist.
    pub default_messages: u64,
    /// How long a cached token-limit estimate stays valid.
    pub cache_ttl: Duration,
}

impl Default for P90Config {
    fn default() -> Self {
        Self {
            common_token_limits: vec![1_000_000, 2_000_000, 8_000_000],
            limit_threshold: 0.95,
            default_min_tokens: 1_000_000,
            default_cost: 100.0,
            default_messages: 150,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// 90th-percentile estimator with a single-value TTL cache for the token
/// limit.
pub struct P90Estimator {
    config: P90Config,
    token_cache: Mutex<Option<(Instant, u64)>>,
}

/// The element at index `⌊0.9·n⌋` (clamped to `n−1`) of the ascending sort.
fn percentile_90<T: Copy + PartialOrd>(mut values: Vec<T>) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((values.len() as f64 * 0.9).floor() as usize).min(values.len() - 1);
    Some(values[idx])
}

impl P90Estimator {
    pub fn new(config: P90Config) -> Self {
        Self {
            config,
            token_cache: Mutex::new(None),
        }
    }

    /// Infer the per-window token limit from historical blocks.
    ///
    /// Prefers limit-hitting sessions (completed non-gap blocks at 95% of a
    /// common tier), falls back to all completed blocks with positive
    /// totals, then to the configured floor. The result is clamped to the
    /// floor and cached for the configured TTL when `use_cache` is set.
    pub fn p90_token_limit(&self, blocks: &[SessionBlock], use_cache: bool) -> u64 {
        if use_cache {
            let cache = self.token_cache.lock().expect("p90 cache poisoned");
            if let Some((at, value)) = *cache {
                if at.elapsed() < self.config.cache_ttl {
                    debug!(value, "p90 token limit served from cache");
                    return value;
                }
            }
        }

        let threshold = self
            .config
            .common_token_limits
            .iter()
            .map(|limit| (*limit as f64 * self.config.limit_threshold) as u64)
            .min()
            .unwrap_or(self.config.default_min_tokens);

        let hitters: Vec<u64> = blocks
            .iter()
            .filter(|b| b.is_finished() && b.total_tokens() >= threshold)
            .map(|b| b.total_tokens())
            .collect();

        let population = if hitters.is_empty() {
            blocks
                .iter()
                .filter(|b| b.is_finished() && b.total_tokens() > 0)
                .map(|b| b.total_tokens())
                .collect()
        } else {
            hitters
        };

        let value = percentile_90(population)
            .unwrap_or(self.config.default_min_tokens)
            .max(self.config.default_min_tokens);

        if use_cache {
            let mut cache = self.token_cache.lock().expect("p90 cache poisoned");
            *cache = Some((Instant::now(), value));
        }
        value
    }

    /// 90th-percentile cost over completed non-gap blocks.
    pub fn p90_cost(&self, blocks: &[SessionBlock]) -> f64 {
        let costs: Vec<f64> = blocks
            .iter()
            .filter(|b| b.is_finished() && b.cost_usd > 0.0)
            .map(|b| b.cost_usd)
            .collect();
        percentile_90(costs).unwrap_or(self.config.default_cost)
    }

    /// 90th-percentile message count over completed non-gap blocks.
    pub fn p90_messages(&self, blocks: &[SessionBlock]) -> u64 {
        let counts: Vec<u64> = blocks
            .iter()
            .filter(|b| b.is_finished() && b.sent_messages_count > 0)
            .map(|b| u64::from(b.sent_messages_count))
            .collect();
        percentile_90(counts).unwrap_or(self.config.default_messages)
    }

    /// Drop any cached estimate.
    pub fn clear_cache(&self) {
        *self.token_cache.lock().expect("p90 cache poisoned") = None;
    }
}

impl Default for P90Estimator {
    fn default() -> Self {
        Self::new(P90Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenCounts;
    use chrono::{TimeZone, Utc};

    fn finished_block(tokens: u64, cost: f64, messages: u32) -> SessionBlock {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        SessionBlock {
            id: start.to_rfc3339(),
            start_time: start,
            end_time: start + chrono::Duration::hours(5),
            is_gap: false,
            is_active: false,
            actual_end_time: Some(start + chrono::Duration::hours(2)),
            token_counts: TokenCounts {
                input_tokens: tokens,
                ..Default::default()
            },
            cost_usd: cost,
            sent_messages_count: messages,
            per_model_stats: Default::default(),
            models: vec![],
            burn_rate: None,
            burn_rate_snapshot: None,
            projection: None,
        }
    }

    #[test]
    fn test_p90_limit_hitting_sessions() {
        let totals = [
            800_000u64, 900_000, 1_000_000, 1_050_000, 1_100_000, 1_150_000, 1_200_000, 1_250_000,
            1_300_000, 2_000_000,
        ];
        let blocks: Vec<SessionBlock> = totals
            .iter()
            .map(|t| finished_block(*t, 1.0, 10))
            .collect();
        let estimator = P90Estimator::default();
        // Hitters are the 8 blocks at or above 950k; index floor(0.9*8)=7
        // clamps to the last element.
        assert_eq!(estimator.p90_token_limit(&blocks, false), 2_000_000);
    }

    #[test]
    fn test_p90_fallback_to_all_completed() {
        let blocks: Vec<SessionBlock> = (1..=10)
            .map(|i| finished_block(i * 10_000, 1.0, 10))
            .collect();
        let estimator = P90Estimator::default();
        // No limit hitters; falls back to all completed blocks, whose p90
        // is below the floor and is clamped up to it.
        assert_eq!(estimator.p90_token_limit(&blocks, false), 1_000_000);
    }

    #[test]
    fn test_p90_empty_returns_default_min() {
        let estimator = P90Estimator::default();
        assert_eq!(estimator.p90_token_limit(&[], false), 1_000_000);
    }

    #[test]
    fn test_p90_ignores_active_and_gap_blocks() {
        let mut active = finished_block(5_000_000, 1.0, 10);
        active.is_active = true;
        let mut gap = finished_block(0, 0.0, 0);
        gap.is_gap = true;
        let estimator = P90Estimator::default();
        assert_eq!(
            estimator.p90_token_limit(&[active, gap], false),
            1_000_000
        );
    }

    #[test]
    fn test_p90_cache_round_trip() {
        let blocks = vec![finished_block(3_000_000, 1.0, 10)];
        let estimator = P90Estimator::default();
        assert_eq!(estimator.p90_token_limit(&blocks, true), 3_000_000);
        // Cached value survives a change in the underlying blocks.
        assert_eq!(estimator.p90_token_limit(&[], true), 3_000_000);
        estimator.clear_cache();
        assert_eq!(estimator.p90_token_limit(&[], true), 1_000_000);
    }

    #[test]
    fn test_p90_cost() {
        let blocks: Vec<SessionBlock> = (1..=10)
            .map(|i| finished_block(10_000, i as f64, 10))
            .collect();
        let estimator = P90Estimator::default();
        // Ascending costs 1..=10; index floor(0.9*10)=9 -> 10.0.
        assert_eq!(estimator.p90_cost(&blocks), 10.0);
    }

    #[test]
    fn test_p90_cost_default_when_empty() {
        let estimator = P90Estimator::default();
        assert_eq!(estimator.p90_cost(&[]), 100.0);
    }

    #[test]
    fn test_p90_messages() {
        let blocks: Vec<SessionBlock> = (1..=5)
            .map(|i| finished_block(10_000, 1.0, i * 20))
            .collect();
        let estimator = P90Estimator::default();
        // Counts [20,40,60,80,100]; index floor(0.9*5)=4 -> 100.
        assert_eq!(estimator.p90_messages(&blocks), 100);
    }

    #[test]
    fn test_p90_messages_default_when_empty() {
        let estimator = P90Estimator::default();
        assert_eq!(estimator.p90_messages(&[]), 150);
    }
}
