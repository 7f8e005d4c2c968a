// crates/engine/src/config.rs
//! Engine configuration, injected at construction time.
//!
//! The enclosing CLI owns flag parsing; the engine only consumes the
//! resolved values.

use crate::limits::Plan;
use chrono_tz::Tz;
use tracing::warn;

/// Resolved monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Subscription plan driving the cost ceiling.
    pub plan: Plan,
    /// Cost ceiling override for custom plans; `None` lets the engine infer
    /// limits from historical blocks.
    pub custom_cost_limit: Option<f64>,
    /// IANA timezone name for calendar grouping; empty or invalid falls
    /// back to the machine's local timezone.
    pub timezone: String,
    /// Billing window length.
    pub session_window: chrono::Duration,
    /// Snapshot refresh tick period.
    pub refresh_interval: std::time::Duration,
    /// TTL of the cached real-time snapshot.
    pub update_interval: std::time::Duration,
    /// Percent-of-limit at which the warning level trips.
    pub warn_threshold_percent: f64,
    /// Percent-of-limit at which the alert level trips.
    pub alert_threshold_percent: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            plan: Plan::Pro,
            custom_cost_limit: None,
            timezone: String::new(),
            session_window: chrono::Duration::hours(5),
            refresh_interval: std::time::Duration::from_secs(1),
            update_interval: std::time::Duration::from_secs(10),
            warn_threshold_percent: 75.0,
            alert_threshold_percent: 90.0,
        }
    }
}

impl MonitorConfig {
    /// Resolve the configured timezone name.
    ///
    /// Empty or unparseable names fall back to the machine's local
    /// timezone, and to UTC when even that cannot be determined.
    pub fn resolved_timezone(&self) -> Tz {
        if !self.timezone.is_empty() {
            match self.timezone.parse::<Tz>() {
                Ok(tz) => return tz,
                Err(_) => {
                    warn!(timezone = %self.timezone, "invalid timezone, using local time");
                }
            }
        }
        iana_time_zone::get_timezone()
            .ok()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}
