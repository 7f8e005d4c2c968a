// crates/engine/src/assembler.rs
//! Snapshot assembler: owns the entry set, fans ingested entries out to the
//! real-time calculator, and publishes coherent snapshots.
//!
//! Publication is generational: every snapshot carries a monotonically
//! increasing generation counter and replaces its predecessor atomically
//! through a `tokio::sync::watch` channel. Consumers read the latest
//! snapshot without taking engine locks; every figure inside one snapshot
//! derives from the same entry-set revision.

use crate::aggregation::{AggregatedData, AggregationEngine, ViewType};
use crate::config::MonitorConfig;
use crate::error::AggregationError;
use crate::limits::{LimitStatus, LimitTracker};
use crate::patterns::{detect_patterns, UsagePattern};
use crate::realtime::{RealtimeCalculator, RealtimeMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokenwatch_core::{
    build_blocks, process_burn_rates, validate_blocks, CostCalculator, CostError, PriceBook,
    SessionBlock, UsageEntry,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The coherent view published to consumers on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Monotonically increasing publication counter.
    pub generation: u64,
    pub produced_at: DateTime<Utc>,
    /// Burn-rate-annotated session blocks, oldest first.
    pub blocks: Vec<SessionBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_block: Option<SessionBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_status: Option<LimitStatus>,
}

impl UsageSnapshot {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            generation: 0,
            produced_at: now,
            blocks: Vec::new(),
            active_block: None,
            realtime: None,
            limit_status: None,
        }
    }
}

/// Orchestrates block reconstruction, burn-rate annotation, real-time
/// metrics, and limit status into one published snapshot per refresh.
pub struct SnapshotAssembler {
    config: MonitorConfig,
    entries: RwLock<Vec<UsageEntry>>,
    realtime: RealtimeCalculator,
    aggregation: AggregationEngine,
    limits: LimitTracker,
    cost: CostCalculator,
    generation: AtomicU64,
    // Serializes publication so generations can never appear out of order.
    publish_lock: Mutex<()>,
    tx: watch::Sender<Arc<UsageSnapshot>>,
}

impl SnapshotAssembler {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_session_start(config, Utc::now())
    }

    /// Construct with an explicit session start (the first refresh anchors
    /// real-time progress on it).
    pub fn with_session_start(config: MonitorConfig, session_start: DateTime<Utc>) -> Self {
        let tz = config.resolved_timezone();
        let (tx, _rx) = watch::channel(Arc::new(UsageSnapshot::empty(session_start)));
        Self {
            realtime: RealtimeCalculator::new(&config, session_start),
            aggregation: AggregationEngine::new(tz),
            limits: LimitTracker::new(&config),
            cost: CostCalculator::new(Arc::new(PriceBook::with_defaults())),
            entries: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
            tx,
            config,
        }
    }

    /// Subscribe to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<UsageSnapshot>> {
        self.tx.subscribe()
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> Arc<UsageSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Ingest one entry from the log tailer.
    ///
    /// Fills in the derived cost when the ingester left it at zero, then
    /// appends to the entry set and the real-time rolling window inside the
    /// same critical section. Blank-model entries are skipped.
    pub fn ingest(&self, entry: UsageEntry) {
        self.ingest_at(entry, Utc::now());
    }

    pub fn ingest_at(&self, mut entry: UsageEntry, now: DateTime<Utc>) {
        if entry.model.trim().is_empty() {
            warn!(timestamp = %entry.timestamp, "skipping entry with blank model");
            return;
        }
        if entry.cost_usd == 0.0 {
            match self.cost.calculate(&entry) {
                Ok(result) => entry.cost_usd = result.total_cost,
                Err(CostError::PricingUnavailable { model, reason }) => {
                    warn!(%model, %reason, "pricing unavailable, keeping zero cost");
                }
                Err(err) => {
                    warn!(error = %err, "skipping uncostable entry");
                    return;
                }
            }
        }

        let mut entries = self.entries.write().expect("entry set poisoned");
        entries.push(entry.clone());
        self.realtime.update_with_new_entry_at(entry, now);
    }

    /// Rebuild every derived figure from the current entry set and publish
    /// a new snapshot.
    pub fn refresh(&self) -> Arc<UsageSnapshot> {
        self.refresh_at(Utc::now())
    }

    pub fn refresh_at(&self, now: DateTime<Utc>) -> Arc<UsageSnapshot> {
        // One clone of the entry set pins the revision every figure in this
        // snapshot derives from.
        let entries: Vec<UsageEntry> = self
            .entries
            .read()
            .expect("entry set poisoned")
            .clone();

        let blocks = build_blocks(&entries, self.config.session_window, now);
        validate_blocks(&blocks);
        let blocks = process_burn_rates(&blocks, now);
        let active_block = blocks.iter().find(|b| b.is_active).cloned();

        let realtime = (*self.realtime.calculate_at(now)).clone();
        let limit_status = self.limits.status(&blocks, active_block.as_ref(), now);

        let _guard = self.publish_lock.lock().expect("publish lock poisoned");
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(UsageSnapshot {
            generation,
            produced_at: now,
            blocks,
            active_block,
            realtime: Some(realtime),
            limit_status: Some(limit_status),
        });
        self.tx.send_replace(Arc::clone(&snapshot));
        debug!(generation, "published usage snapshot");
        snapshot
    }

    /// Historical rollups over the current entry set.
    pub fn aggregate(
        &self,
        view: ViewType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Arc<Vec<AggregatedData>>, AggregationError> {
        let entries: Vec<UsageEntry> = self
            .entries
            .read()
            .expect("entry set poisoned")
            .clone();
        self.aggregation.aggregate(&entries, view, start, end)
    }

    /// Usage patterns over a rollup of the current entry set.
    pub fn patterns(
        &self,
        view: ViewType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsagePattern, AggregationError> {
        let entries: Vec<UsageEntry> = self
            .entries
            .read()
            .expect("entry set poisoned")
            .clone();
        let periods = self.aggregation.aggregate(&entries, view, start, end)?;
        Ok(detect_patterns(&periods, &entries, self.aggregation.timezone()))
    }

    /// Restart the real-time session window.
    pub fn reset_session(&self, new_session_start: DateTime<Utc>) {
        self.realtime.reset(new_session_start);
    }

    /// Drive the refresh tick until cancellation.
    ///
    /// On shutdown the in-flight refresh completes, no further ticks fire,
    /// and all caches are cleared.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.aggregation.clear_cache();
                    self.limits.clear_cache();
                    self.realtime.clear_cache();
                    debug!("refresh loop stopped, caches cleared");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh();
                }
            }
        }
    }
}
