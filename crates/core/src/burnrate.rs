// crates/core/src/burnrate.rs
//! Burn-rate calculation: per-block and fleet-wide consumption rates plus
//! linear projections to window close.
//!
//! `process_burn_rates` is pure: it returns a freshly annotated block list
//! instead of mutating under concurrent readers, matching the engine's
//! generational publish model.

use crate::types::{BurnRate, SessionBlock, UsageProjection};
use chrono::{DateTime, Duration, Utc};

/// Current consumption rate of a single block.
///
/// Returns `None` for inactive blocks, blocks shorter than one minute, and
/// blocks with zero tokens.
pub fn calculate_burn_rate(block: &SessionBlock) -> Option<BurnRate> {
    if !block.is_active || block.is_gap {
        return None;
    }
    let end = block.actual_end_time.unwrap_or(block.end_time);
    let duration_minutes = (end - block.start_time).num_seconds() as f64 / 60.0;
    if duration_minutes < 1.0 {
        return None;
    }
    let total_tokens = block.total_tokens();
    if total_tokens == 0 {
        return None;
    }
    Some(BurnRate {
        tokens_per_minute: total_tokens as f64 / duration_minutes,
        cost_per_hour: (block.cost_usd / duration_minutes) * 60.0,
    })
}

/// Linear extrapolation of a block's totals over its remaining window.
///
/// `None` when the block has no burn rate or its window has already closed.
pub fn project_block_usage(block: &SessionBlock, now: DateTime<Utc>) -> Option<UsageProjection> {
    let rate = calculate_burn_rate(block)?;
    if now >= block.end_time {
        return None;
    }
    let remaining_minutes = block.remaining_minutes(now);
    let projected_extra_tokens = rate.tokens_per_minute * remaining_minutes;
    let projected_extra_cost = (rate.cost_per_hour / 60.0) * remaining_minutes;
    Some(UsageProjection {
        projected_total_tokens: block.total_tokens() + projected_extra_tokens.round() as u64,
        projected_total_cost: block.cost_usd + projected_extra_cost,
        remaining_minutes,
    })
}

/// Fleet-wide tokens-per-minute over the hour ending at `reference`.
///
/// Each non-gap block contributes the share of its tokens that falls inside
/// `[reference − 1h, reference]`, attributed by time weighting: an active
/// block's effective end is `reference`; a completed block ends at its
/// actual end time (nominal close when unset).
pub fn hourly_burn_rate(blocks: &[SessionBlock], reference: DateTime<Utc>) -> f64 {
    let hour_ago = reference - Duration::hours(1);
    let mut tokens_in_hour = 0.0;

    for block in blocks {
        if block.is_gap || block.total_tokens() == 0 {
            continue;
        }
        let block_end = if block.is_active {
            reference
        } else {
            block.actual_end_time.unwrap_or(block.end_time)
        };
        let overlap_start = block.start_time.max(hour_ago);
        let overlap_end = block_end.min(reference);
        if overlap_end <= overlap_start {
            continue;
        }
        let overlap_minutes = (overlap_end - overlap_start).num_seconds() as f64 / 60.0;
        let block_minutes = (block_end - block.start_time).num_seconds() as f64 / 60.0;
        if block_minutes <= 0.0 {
            continue;
        }
        tokens_in_hour += block.total_tokens() as f64 * (overlap_minutes / block_minutes);
    }

    tokens_in_hour / 60.0
}

/// Sum of per-block rates across all active blocks, no time weighting.
pub fn global_burn_rate(blocks: &[SessionBlock]) -> BurnRate {
    let mut total = BurnRate {
        tokens_per_minute: 0.0,
        cost_per_hour: 0.0,
    };
    for block in blocks.iter().filter(|b| b.is_active) {
        if let Some(rate) = calculate_burn_rate(block) {
            total.tokens_per_minute += rate.tokens_per_minute;
            total.cost_per_hour += rate.cost_per_hour;
        }
    }
    total
}

/// Annotate every active block with its burn rate, burn-rate snapshot, and
/// projection. Pure: returns a new list, inputs are untouched.
pub fn process_burn_rates(blocks: &[SessionBlock], now: DateTime<Utc>) -> Vec<SessionBlock> {
    blocks
        .iter()
        .map(|block| {
            let mut annotated = block.clone();
            if block.is_active {
                let rate = calculate_burn_rate(block);
                annotated.burn_rate = rate;
                annotated.burn_rate_snapshot = rate;
                annotated.projection = project_block_usage(block, now);
            }
            annotated
        })
        .collect()
}
