// crates/engine/src/limits.rs
//! Plan limits and limit-status computation.
//!
//! Fixed plans carry a configured cost ceiling; custom plans may supply
//! their own or let the engine infer thresholds from historical blocks via
//! the P90 estimator.

use crate::config::MonitorConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokenwatch_core::{duration_nanos, P90Estimator, SessionBlock};

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Pro,
    Max5,
    Max20,
    Custom,
}

impl Plan {
    /// Default USD cost ceiling per billing window; custom plans have none.
    pub fn default_cost_limit(&self) -> Option<f64> {
        match self {
            Plan::Pro => Some(18.00),
            Plan::Max5 => Some(35.00),
            Plan::Max20 => Some(140.00),
            Plan::Custom => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Pro => "pro",
            Plan::Max5 => "max5",
            Plan::Max20 => "max20",
            Plan::Custom => "custom",
        }
    }
}

/// Effective per-window limits for the configured plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub tokens: u64,
    pub cost: f64,
    pub messages: u64,
}

/// How close the current window is to its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Ok,
    Warning,
    Alert,
    Exceeded,
}

/// Limit usage report for the active billing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitStatus {
    pub plan: Plan,
    pub limits: PlanLimits,
    pub current_tokens: u64,
    pub current_cost: f64,
    /// Percentage of the cost ceiling consumed, uncapped.
    pub percent_used: f64,
    pub warning_level: WarningLevel,
    pub recommendations: Vec<String>,
    /// Time until the active window closes; zero without an active window.
    #[serde(with = "duration_nanos")]
    pub time_to_reset: Duration,
}

/// Computes [`LimitStatus`] from the active block and historical blocks.
pub struct LimitTracker {
    plan: Plan,
    custom_cost_limit: Option<f64>,
    warn_threshold_percent: f64,
    alert_threshold_percent: f64,
    estimator: P90Estimator,
}

impl LimitTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            plan: config.plan,
            custom_cost_limit: config.custom_cost_limit,
            warn_threshold_percent: config.warn_threshold_percent,
            alert_threshold_percent: config.alert_threshold_percent,
            estimator: P90Estimator::default(),
        }
    }

    /// Effective limits: plan cost ceiling where fixed, P90 inference for
    /// tokens and messages (and for cost in custom mode without an
    /// explicit ceiling).
    pub fn effective_limits(&self, blocks: &[SessionBlock]) -> PlanLimits {
        let cost = match self.plan {
            Plan::Custom => self
                .custom_cost_limit
                .unwrap_or_else(|| self.estimator.p90_cost(blocks)),
            fixed => fixed
                .default_cost_limit()
                .expect("fixed plans define a cost limit"),
        };
        PlanLimits {
            tokens: self.estimator.p90_token_limit(blocks, true),
            cost,
            messages: self.estimator.p90_messages(blocks),
        }
    }

    /// Drop the estimator's cached thresholds.
    pub fn clear_cache(&self) {
        self.estimator.clear_cache();
    }

    /// Compute the status of the current window.
    pub fn status(
        &self,
        blocks: &[SessionBlock],
        active: Option<&SessionBlock>,
        now: DateTime<Utc>,
    ) -> LimitStatus {
        let limits = self.effective_limits(blocks);
        let (current_tokens, current_cost, time_to_reset) = match active {
            Some(block) => (
                block.total_tokens(),
                block.cost_usd,
                (block.end_time - now).max(Duration::zero()),
            ),
            None => (0, 0.0, Duration::zero()),
        };

        let percent_used = if limits.cost > 0.0 {
            (current_cost / limits.cost) * 100.0
        } else {
            0.0
        };

        let warning_level = if percent_used >= 100.0 {
            WarningLevel::Exceeded
        } else if percent_used >= self.alert_threshold_percent {
            WarningLevel::Alert
        } else if percent_used >= self.warn_threshold_percent {
            WarningLevel::Warning
        } else {
            WarningLevel::Ok
        };

        let recommendations = recommendations_for(warning_level, active, &limits);

        LimitStatus {
            plan: self.plan,
            limits,
            current_tokens,
            current_cost,
            percent_used,
            warning_level,
            recommendations,
            time_to_reset,
        }
    }
}

fn recommendations_for(
    level: WarningLevel,
    active: Option<&SessionBlock>,
    limits: &PlanLimits,
) -> Vec<String> {
    let mut recs = Vec::new();
    match level {
        WarningLevel::Ok => {}
        WarningLevel::Warning => {
            recs.push("Approaching the window cost limit; consider a cheaper model for routine work.".to_string());
        }
        WarningLevel::Alert => {
            recs.push("Close to the window cost limit; defer non-essential requests until the window resets.".to_string());
        }
        WarningLevel::Exceeded => {
            recs.push("Window cost limit exceeded; further usage is billed beyond the plan ceiling.".to_string());
        }
    }
    if let Some(block) = active {
        if let Some(rate) = &block.burn_rate {
            let remaining_cost = limits.cost - block.cost_usd;
            if rate.cost_per_hour > 0.0 && remaining_cost > 0.0 {
                let hours_left = remaining_cost / rate.cost_per_hour;
                if hours_left < 1.0 {
                    recs.push(format!(
                        "At the current burn rate the cost limit is reached in about {:.0} minutes.",
                        hours_left * 60.0
                    ));
                }
            }
        }
    }
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokenwatch_core::TokenCounts;

    fn active_block(tokens: u64, cost: f64) -> SessionBlock {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        SessionBlock {
            id: start.to_rfc3339(),
            start_time: start,
            end_time: start + Duration::hours(5),
            is_gap: false,
            is_active: true,
            actual_end_time: Some(start + Duration::hours(1)),
            token_counts: TokenCounts {
                input_tokens: tokens,
                ..Default::default()
            },
            cost_usd: cost,
            sent_messages_count: 10,
            per_model_stats: Default::default(),
            models: vec![],
            burn_rate: None,
            burn_rate_snapshot: None,
            projection: None,
        }
    }

    fn tracker(plan: Plan) -> LimitTracker {
        LimitTracker::new(&MonitorConfig {
            plan,
            ..Default::default()
        })
    }

    #[test]
    fn test_plan_default_cost_limits() {
        assert_eq!(Plan::Pro.default_cost_limit(), Some(18.00));
        assert_eq!(Plan::Max5.default_cost_limit(), Some(35.00));
        assert_eq!(Plan::Max20.default_cost_limit(), Some(140.00));
        assert_eq!(Plan::Custom.default_cost_limit(), None);
    }

    #[test]
    fn test_plan_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Max5).unwrap(), r#""max5""#);
        let back: Plan = serde_json::from_str(r#""max20""#).unwrap();
        assert_eq!(back, Plan::Max20);
    }

    #[test]
    fn test_status_ok_level() {
        let block = active_block(1000, 1.0);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();
        let status = tracker(Plan::Pro).status(&[block.clone()], Some(&block), now);
        assert_eq!(status.warning_level, WarningLevel::Ok);
        assert!((status.percent_used - 100.0 / 18.0).abs() < 1e-9);
        assert_eq!(status.time_to_reset, Duration::hours(4));
        assert!(status.recommendations.is_empty());
    }

    #[test]
    fn test_status_warning_and_alert_levels() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();
        let warn_block = active_block(1000, 14.0); // 77.8% of $18
        let status = tracker(Plan::Pro).status(&[warn_block.clone()], Some(&warn_block), now);
        assert_eq!(status.warning_level, WarningLevel::Warning);
        assert!(!status.recommendations.is_empty());

        let alert_block = active_block(1000, 17.0); // 94.4%
        let status = tracker(Plan::Pro).status(&[alert_block.clone()], Some(&alert_block), now);
        assert_eq!(status.warning_level, WarningLevel::Alert);
    }

    #[test]
    fn test_status_exceeded() {
        let block = active_block(1000, 20.0);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();
        let status = tracker(Plan::Pro).status(&[block.clone()], Some(&block), now);
        assert_eq!(status.warning_level, WarningLevel::Exceeded);
        assert!(status.percent_used > 100.0);
    }

    #[test]
    fn test_status_without_active_block() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();
        let status = tracker(Plan::Max5).status(&[], None, now);
        assert_eq!(status.current_tokens, 0);
        assert_eq!(status.current_cost, 0.0);
        assert_eq!(status.percent_used, 0.0);
        assert_eq!(status.time_to_reset, Duration::zero());
        assert_eq!(status.warning_level, WarningLevel::Ok);
    }

    #[test]
    fn test_custom_plan_uses_supplied_limit() {
        let tracker = LimitTracker::new(&MonitorConfig {
            plan: Plan::Custom,
            custom_cost_limit: Some(50.0),
            ..Default::default()
        });
        let limits = tracker.effective_limits(&[]);
        assert_eq!(limits.cost, 50.0);
    }

    #[test]
    fn test_custom_plan_without_limit_infers_p90() {
        let tracker = tracker(Plan::Custom);
        let limits = tracker.effective_limits(&[]);
        // No history: the estimator's default cost.
        assert_eq!(limits.cost, 100.0);
        assert_eq!(limits.tokens, 1_000_000);
        assert_eq!(limits.messages, 150);
    }
}
