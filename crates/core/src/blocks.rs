// crates/core/src/blocks.rs
//! Session block reconstruction: groups an ordered entry stream into
//! fixed-width billing windows separated by inactivity gaps.
//!
//! `build_blocks` is a pure function: the engine always rebuilds the whole
//! list from the current entry set instead of mutating blocks in place.

use crate::types::{ModelStats, SessionBlock, TokenCounts, UsageEntry};
use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::warn;

/// Default billing window length: 5 hours.
pub fn default_session_window() -> Duration {
    Duration::hours(5)
}

/// Floor a timestamp to the top of its UTC hour.
fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

fn open_block(first: &UsageEntry, window: Duration) -> SessionBlock {
    let start = floor_to_hour(first.timestamp);
    let mut block = SessionBlock {
        id: start.to_rfc3339(),
        start_time: start,
        end_time: start + window,
        is_gap: false,
        is_active: false,
        actual_end_time: None,
        token_counts: TokenCounts::default(),
        cost_usd: 0.0,
        sent_messages_count: 0,
        per_model_stats: Default::default(),
        models: Vec::new(),
        burn_rate: None,
        burn_rate_snapshot: None,
        projection: None,
    };
    append_entry(&mut block, first);
    block
}

fn gap_block(start: DateTime<Utc>, end: DateTime<Utc>) -> SessionBlock {
    SessionBlock {
        id: format!("gap-{}", start.to_rfc3339()),
        start_time: start,
        end_time: end,
        is_gap: true,
        is_active: false,
        actual_end_time: None,
        token_counts: TokenCounts::default(),
        cost_usd: 0.0,
        sent_messages_count: 0,
        per_model_stats: Default::default(),
        models: Vec::new(),
        burn_rate: None,
        burn_rate_snapshot: None,
        projection: None,
    }
}

fn append_entry(block: &mut SessionBlock, entry: &UsageEntry) {
    block.token_counts.add_entry(entry);
    block.cost_usd += entry.cost_usd;
    block.sent_messages_count += 1;
    if !block.per_model_stats.contains_key(&entry.model) {
        block.models.push(entry.model.clone());
    }
    block
        .per_model_stats
        .entry(entry.model.clone())
        .or_insert_with(ModelStats::default)
        .add_entry(entry);
    block.actual_end_time = Some(entry.timestamp);
}

/// Group a timestamp-ordered entry stream into session blocks.
///
/// A block opens at the first entry's hour floor and spans `window`. An
/// inactivity gap of at least `window` closes the block and inserts a
/// synthetic gap placeholder covering the quiet interval. An entry exactly
/// at a block's `end_time` starts the next block.
///
/// Exactly one block can be active: the latest non-gap block whose window
/// contains `now` and which holds at least one entry. All other non-gap
/// blocks carry `actual_end_time` = their latest entry timestamp.
///
/// Out-of-order entries are skipped with a warning; they never abort the
/// rebuild.
pub fn build_blocks(
    entries: &[UsageEntry],
    window: Duration,
    now: DateTime<Utc>,
) -> Vec<SessionBlock> {
    let mut blocks: Vec<SessionBlock> = Vec::new();
    let mut current: Option<SessionBlock> = None;
    let mut latest: Option<DateTime<Utc>> = None;

    for entry in entries {
        if let Some(prev_ts) = latest {
            if entry.timestamp < prev_ts {
                warn!(
                    timestamp = %entry.timestamp,
                    model = %entry.model,
                    "skipping out-of-order usage entry"
                );
                continue;
            }
        }

        match current.take() {
            None => {
                current = Some(open_block(entry, window));
            }
            Some(mut block) => {
                let last_ts = latest.unwrap_or(block.start_time);
                if entry.timestamp - last_ts >= window && entry.timestamp > block.end_time {
                    // Inactivity of a full window: close out and bridge the
                    // quiet interval with a gap placeholder.
                    let gap_start = block.end_time;
                    blocks.push(block);
                    blocks.push(gap_block(gap_start, entry.timestamp));
                    current = Some(open_block(entry, window));
                } else if entry.timestamp < block.end_time {
                    append_entry(&mut block, entry);
                    current = Some(block);
                } else {
                    // Past the window close but within the inactivity
                    // threshold: contiguous blocks, no gap.
                    blocks.push(block);
                    current = Some(open_block(entry, window));
                }
            }
        }
        latest = Some(entry.timestamp);
    }
    if let Some(block) = current {
        blocks.push(block);
    }

    // Active marking: the latest qualifying window wins, everything else is
    // finished and keeps its actual end time.
    let active_idx = blocks
        .iter()
        .enumerate()
        .rev()
        .find(|(_, b)| {
            !b.is_gap && b.sent_messages_count > 0 && now >= b.start_time && now <= b.end_time
        })
        .map(|(i, _)| i);
    for (i, block) in blocks.iter_mut().enumerate() {
        if Some(i) == active_idx {
            block.is_active = true;
        }
    }

    blocks
}

/// Non-fatal invariant audit over a reconstructed block list.
///
/// Returns human-readable violation descriptions (empty when the list is
/// consistent) and logs each at warn level. Computation continues with the
/// observed values regardless.
pub fn validate_blocks(blocks: &[SessionBlock]) -> Vec<String> {
    let mut violations = Vec::new();

    // A gap block may share its start with the following hour-floored
    // block, so ordering is non-decreasing rather than strict.
    for pair in blocks.windows(2) {
        if pair[1].start_time < pair[0].start_time {
            violations.push(format!(
                "blocks out of order: {} starts before {}",
                pair[1].id, pair[0].id
            ));
        }
    }

    for block in blocks {
        if block.is_gap {
            if block.total_tokens() != 0 || block.cost_usd != 0.0 || block.sent_messages_count != 0
            {
                violations.push(format!("gap block {} carries usage", block.id));
            }
            continue;
        }

        let model_tokens: u64 = block
            .per_model_stats
            .values()
            .map(ModelStats::total_tokens)
            .sum();
        if model_tokens != block.total_tokens() {
            violations.push(format!(
                "block {}: per-model token sum {} != aggregate {}",
                block.id,
                model_tokens,
                block.total_tokens()
            ));
        }

        let model_cost: f64 = block.per_model_stats.values().map(|s| s.cost_usd).sum();
        if (model_cost - block.cost_usd).abs() > 1e-6 {
            violations.push(format!(
                "block {}: per-model cost sum {} != aggregate {}",
                block.id, model_cost, block.cost_usd
            ));
        }
    }

    let active = blocks.iter().filter(|b| b.is_active).count();
    if active > 1 {
        violations.push(format!("{} blocks are simultaneously active", active));
    }

    for v in &violations {
        warn!(violation = %v, "session block invariant violation");
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn entry_at(ts: DateTime<Utc>, model: &str, tokens: u64) -> UsageEntry {
        UsageEntry {
            timestamp: ts,
            model: model.to_string(),
            input_tokens: tokens,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: tokens as f64 * 3.0 / 1_000_000.0,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_single_model_block() {
        let entries = vec![
            entry_at(at(10, 0), "sonnet", 1000),
            entry_at(at(10, 30), "sonnet", 1000),
            entry_at(at(11, 0), "sonnet", 1000),
        ];
        let now = at(11, 0);
        let blocks = build_blocks(&entries, default_session_window(), now);

        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.start_time, at(10, 0));
        assert_eq!(block.end_time, at(15, 0));
        assert_eq!(block.total_tokens(), 3000);
        assert!(block.is_active);
        assert!((block.cost_usd - 0.009).abs() < 1e-9);
        assert_eq!(block.sent_messages_count, 3);
        assert_eq!(block.models, vec!["sonnet".to_string()]);
    }

    #[test]
    fn test_gap_insertion() {
        let entries = vec![
            entry_at(at(9, 0), "sonnet", 100),
            entry_at(at(15, 30), "sonnet", 100),
        ];
        let now = at(16, 0);
        let blocks = build_blocks(&entries, default_session_window(), now);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].start_time, at(9, 0));
        assert_eq!(blocks[0].end_time, at(14, 0));
        assert!(!blocks[0].is_gap);

        assert!(blocks[1].is_gap);
        assert_eq!(blocks[1].start_time, at(14, 0));
        assert_eq!(blocks[1].end_time, at(15, 30));
        assert_eq!(blocks[1].total_tokens(), 0);
        assert_eq!(blocks[1].cost_usd, 0.0);

        assert_eq!(blocks[2].start_time, at(15, 0));
        assert_eq!(blocks[2].end_time, at(20, 0));
        assert!(blocks[2].is_active);
    }

    #[test]
    fn test_entry_exactly_at_end_starts_next_block() {
        let entries = vec![
            entry_at(at(10, 30), "sonnet", 100),
            entry_at(at(15, 0), "sonnet", 100),
        ];
        let now = at(15, 30);
        let blocks = build_blocks(&entries, default_session_window(), now);

        assert_eq!(blocks.len(), 2);
        assert!(!blocks[1].is_gap);
        assert_eq!(blocks[0].end_time, at(15, 0));
        assert_eq!(blocks[0].sent_messages_count, 1);
        assert_eq!(blocks[1].start_time, at(15, 0));
        assert_eq!(blocks[1].sent_messages_count, 1);
    }

    #[test]
    fn test_gap_of_exactly_window_triggers_gap() {
        let entries = vec![
            entry_at(at(1, 15), "sonnet", 100),
            entry_at(at(6, 15), "sonnet", 100),
        ];
        let now = at(7, 0);
        let blocks = build_blocks(&entries, default_session_window(), now);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].is_gap);
    }

    #[test]
    fn test_contiguous_blocks_without_gap() {
        // Second entry past the window close but inside the inactivity
        // threshold: two back-to-back blocks, no gap between them.
        let entries = vec![
            entry_at(at(1, 45), "sonnet", 100),
            entry_at(at(6, 30), "sonnet", 100),
        ];
        let now = at(6, 45);
        let blocks = build_blocks(&entries, default_session_window(), now);
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].is_gap);
        assert!(!blocks[1].is_gap);
        assert_eq!(blocks[0].end_time, at(6, 0));
        assert_eq!(blocks[1].start_time, at(6, 0));
    }

    #[test]
    fn test_completed_block_gets_actual_end_time() {
        let entries = vec![
            entry_at(at(1, 0), "sonnet", 100),
            entry_at(at(2, 15), "sonnet", 100),
        ];
        // Wall clock far past the window.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let blocks = build_blocks(&entries, default_session_window(), now);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].is_active);
        assert_eq!(blocks[0].actual_end_time, Some(at(2, 15)));
    }

    #[test]
    fn test_single_entry_active_iff_now_in_window() {
        let entries = vec![entry_at(at(10, 30), "sonnet", 100)];
        let inside = build_blocks(&entries, default_session_window(), at(12, 0));
        assert!(inside[0].is_active);

        let outside = build_blocks(
            &entries,
            default_session_window(),
            Utc.with_ymd_and_hms(2025, 6, 1, 15, 30, 0).unwrap(),
        );
        assert!(!outside[0].is_active);
    }

    #[test]
    fn test_at_most_one_active_block() {
        let entries = vec![
            entry_at(at(1, 0), "sonnet", 100),
            entry_at(at(6, 30), "sonnet", 100),
        ];
        let now = at(6, 45);
        let blocks = build_blocks(&entries, default_session_window(), now);
        assert_eq!(blocks.iter().filter(|b| b.is_active).count(), 1);
        assert!(blocks[1].is_active);
    }

    #[test]
    fn test_out_of_order_entry_skipped() {
        let entries = vec![
            entry_at(at(10, 0), "sonnet", 100),
            entry_at(at(9, 0), "sonnet", 999),
            entry_at(at(10, 30), "sonnet", 100),
        ];
        let blocks = build_blocks(&entries, default_session_window(), at(11, 0));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].total_tokens(), 200);
    }

    #[test]
    fn test_multi_model_per_model_stats() {
        let entries = vec![
            entry_at(at(10, 0), "sonnet", 1000),
            entry_at(at(10, 10), "opus", 500),
            entry_at(at(10, 20), "sonnet", 1000),
        ];
        let blocks = build_blocks(&entries, default_session_window(), at(11, 0));
        let block = &blocks[0];
        assert_eq!(block.models, vec!["sonnet".to_string(), "opus".to_string()]);
        assert_eq!(block.per_model_stats["sonnet"].input_tokens, 2000);
        assert_eq!(block.per_model_stats["opus"].input_tokens, 500);
        assert_eq!(block.per_model_stats["sonnet"].entries_count, 2);
        assert_eq!(block.total_tokens(), 2500);
        assert!(validate_blocks(&blocks).is_empty());
    }

    #[test]
    fn test_build_is_deterministic() {
        let entries = vec![
            entry_at(at(9, 0), "sonnet", 100),
            entry_at(at(10, 30), "opus", 200),
            entry_at(at(16, 0), "sonnet", 300),
        ];
        let now = at(17, 0);
        let a = build_blocks(&entries, default_session_window(), now);
        let b = build_blocks(&entries, default_session_window(), now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input() {
        let blocks = build_blocks(&[], default_session_window(), at(12, 0));
        assert!(blocks.is_empty());
        assert!(validate_blocks(&blocks).is_empty());
    }

    #[test]
    fn test_validate_detects_gap_with_usage() {
        let mut blocks = build_blocks(
            &[entry_at(at(9, 0), "sonnet", 100), entry_at(at(15, 30), "sonnet", 100)],
            default_session_window(),
            at(16, 0),
        );
        blocks[1].token_counts.input_tokens = 5;
        let violations = validate_blocks(&blocks);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("gap block"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn build_twice_is_structurally_identical(
                offsets in proptest::collection::vec(0i64..72_000, 0..40)
            ) {
                let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
                let mut minutes: Vec<i64> = offsets;
                minutes.sort_unstable();
                let entries: Vec<UsageEntry> = minutes
                    .iter()
                    .map(|m| entry_at(base + Duration::minutes(*m / 10), "sonnet", 100))
                    .collect();
                let now = base + Duration::hours(130);
                let a = build_blocks(&entries, default_session_window(), now);
                let b = build_blocks(&entries, default_session_window(), now);
                prop_assert_eq!(a, b);
            }

            #[test]
            fn blocks_are_ordered_and_consistent(
                offsets in proptest::collection::vec(0i64..72_000, 1..40)
            ) {
                let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
                let mut minutes: Vec<i64> = offsets;
                minutes.sort_unstable();
                let entries: Vec<UsageEntry> = minutes
                    .iter()
                    .map(|m| entry_at(base + Duration::minutes(*m / 10), "sonnet", 100))
                    .collect();
                let now = base + Duration::hours(130);
                let blocks = build_blocks(&entries, default_session_window(), now);
                prop_assert!(validate_blocks(&blocks).is_empty());
                for pair in blocks.windows(2) {
                    prop_assert!(pair[0].start_time <= pair[1].start_time);
                }
            }
        }
    }
}
