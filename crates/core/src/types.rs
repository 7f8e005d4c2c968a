// crates/core/src/types.rs
//! Core data model shared by every analytics component.
//!
//! All snapshot-facing types serialize with snake_case field names,
//! RFC-3339 UTC timestamps, and integer-nanosecond durations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Custom serializer for `chrono::Duration` fields: integer nanoseconds on
/// the wire, matching how consumers expect `time_remaining` and friends.
pub mod duration_nanos {
    use chrono::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_nanoseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::nanoseconds(nanos))
    }
}

/// One assistant message's billing record, as delivered by the ingester.
///
/// Immutable once created; the engine never mutates a delivered entry
/// (cost may be filled in on ingest when the ingester left it at zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// UTC instant the request was billed at.
    pub timestamp: DateTime<Utc>,
    /// Raw model identifier; may be unknown or blank.
    #[serde(default)]
    pub model: String,
    /// Input (prompt) tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output (completion) tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens written into the prompt cache.
    #[serde(default)]
    pub cache_creation_tokens: u64,
    /// Tokens read back from the prompt cache.
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Cost in USD; zero when the ingester did not pre-compute it.
    #[serde(default)]
    pub cost_usd: f64,
}

impl UsageEntry {
    /// Sum of all four token classes.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Aggregated token counts across multiple usage entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    /// Sum of all four token classes.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// Accumulate one entry's counts.
    pub fn add_entry(&mut self, entry: &UsageEntry) {
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cache_creation_tokens += entry.cache_creation_tokens;
        self.cache_read_tokens += entry.cache_read_tokens;
    }
}

/// Instantaneous consumption rates for a session block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    /// Tokens consumed per minute.
    pub tokens_per_minute: f64,
    /// US dollar cost per hour.
    pub cost_per_hour: f64,
}

/// Forward projection of a block's total consumption at window close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageProjection {
    pub projected_total_tokens: u64,
    pub projected_total_cost: f64,
    pub remaining_minutes: f64,
}

/// Per-model statistics within one session block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub entries_count: u32,
}

impl ModelStats {
    /// Sum of all four token classes attributed to this model.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn add_entry(&mut self, entry: &UsageEntry) {
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cache_creation_tokens += entry.cache_creation_tokens;
        self.cache_read_tokens += entry.cache_read_tokens;
        self.cost_usd += entry.cost_usd;
        self.entries_count += 1;
    }
}

/// A fixed-length billing window (default 5 h) of consecutive entries, or a
/// synthetic gap placeholder covering an inactivity interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBlock {
    /// Unique identifier for this block.
    pub id: String,
    /// Window origin: first entry's timestamp floored to the hour (UTC).
    pub start_time: DateTime<Utc>,
    /// Nominal window close: `start_time + window length`. For gap blocks,
    /// the timestamp of the entry that ended the gap.
    pub end_time: DateTime<Utc>,
    /// True for synthetic inactivity placeholders; gap blocks carry no
    /// entries, tokens, or cost.
    #[serde(default)]
    pub is_gap: bool,
    /// True iff the wall clock is inside `[start_time, end_time]` and the
    /// block holds at least one entry.
    #[serde(default)]
    pub is_active: bool,
    /// Timestamp of the latest entry in the block; marks the early close
    /// point when it differs from the nominal `end_time`.
    #[serde(default)]
    pub actual_end_time: Option<DateTime<Utc>>,
    /// Aggregate token counts for the block.
    #[serde(default)]
    pub token_counts: TokenCounts,
    /// Total cost in USD for the block.
    #[serde(default)]
    pub cost_usd: f64,
    /// Number of usage entries (messages) in the block.
    #[serde(default)]
    pub sent_messages_count: u32,
    /// Token and cost statistics broken down by model.
    #[serde(default)]
    pub per_model_stats: HashMap<String, ModelStats>,
    /// Model names in order of first appearance.
    #[serde(default)]
    pub models: Vec<String>,
    /// Current burn rate, populated for active blocks by the annotation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_rate: Option<BurnRate>,
    /// Burn rate captured at annotation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_rate_snapshot: Option<BurnRate>,
    /// Linear projection to window close, populated for active blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<UsageProjection>,
}

impl SessionBlock {
    /// Sum of the block's four aggregate token classes.
    pub fn total_tokens(&self) -> u64 {
        self.token_counts.total_tokens()
    }

    /// Total cost in USD.
    pub fn total_cost(&self) -> f64 {
        self.cost_usd
    }

    /// Elapsed block duration in minutes, clamped to at least 1.0.
    ///
    /// Uses `actual_end_time` when the block closed early, otherwise the
    /// nominal `end_time`.
    pub fn duration_minutes(&self) -> f64 {
        let end = self.actual_end_time.unwrap_or(self.end_time);
        let secs = (end - self.start_time).num_seconds() as f64;
        f64::max(secs / 60.0, 1.0)
    }

    /// Minutes left until the nominal window close; zero once past it.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> f64 {
        let secs = (self.end_time - now).num_seconds() as f64;
        f64::max(secs / 60.0, 0.0)
    }

    /// A completed block: not a gap, not currently active.
    pub fn is_finished(&self) -> bool {
        !self.is_gap && !self.is_active
    }
}
