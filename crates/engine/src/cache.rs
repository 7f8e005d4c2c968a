// crates/engine/src/cache.rs
//! TTL + size-bounded result cache for aggregation rollups.
//!
//! Eviction is oldest-inserted-first: when an insert would pass the size
//! ceiling, the single stalest slot is dropped.

use crate::aggregation::{AggregatedData, ViewType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

pub type CacheKey = (ViewType, DateTime<Utc>, DateTime<Utc>);

struct Slot {
    inserted_at: Instant,
    value: Arc<Vec<AggregatedData>>,
}

pub struct AggregationCache {
    ttl: Duration,
    max_size: usize,
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl AggregationCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size: max_size.max(1),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a live slot; expired slots read as absent.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<AggregatedData>>> {
        let slots = self.slots.read().expect("aggregation cache poisoned");
        let slot = slots.get(key)?;
        if slot.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        debug!(view = ?key.0, "aggregation cache hit");
        Some(Arc::clone(&slot.value))
    }

    /// Store a result, evicting the oldest slot at the ceiling.
    pub fn insert(&self, key: CacheKey, value: Arc<Vec<AggregatedData>>) {
        let mut slots = self.slots.write().expect("aggregation cache poisoned");
        if slots.len() >= self.max_size && !slots.contains_key(&key) {
            if let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.inserted_at)
                .map(|(k, _)| *k)
            {
                debug!(view = ?oldest.0, "evicting oldest aggregation cache slot");
                slots.remove(&oldest);
            }
        }
        slots.insert(
            key,
            Slot {
                inserted_at: Instant::now(),
                value,
            },
        );
    }

    pub fn clear(&self) {
        self.slots.write().expect("aggregation cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("aggregation cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AggregationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 100)
    }
}
