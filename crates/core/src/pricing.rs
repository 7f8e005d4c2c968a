// crates/core/src/pricing.rs
//! Price book: per-model token rates and pricing resolution.
//!
//! Single source of truth for:
//! - `ModelPricing` struct (USD per million tokens, four token classes)
//! - `PriceBook` with exact → prefix lookup and sonnet-tier fallback
//! - `PricingSource`, the resolution capability the cost calculator
//!   consumes, implemented by the static book and by dynamic providers
//! - Hardcoded defaults for offline operation

use crate::error::CostError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Per-model pricing in USD per 1 000 000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_creation_per_million: f64,
    pub cache_read_per_million: f64,
}

/// Published sonnet-tier rates; also the fallback for unrecognized models.
pub const SONNET_PRICING: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
    cache_creation_per_million: 3.75,
    cache_read_per_million: 0.30,
};

/// Published opus-tier rates.
pub const OPUS_PRICING: ModelPricing = ModelPricing {
    input_per_million: 15.0,
    output_per_million: 75.0,
    cache_creation_per_million: 18.75,
    cache_read_per_million: 1.50,
};

/// Published haiku-tier rates.
pub const HAIKU_PRICING: ModelPricing = ModelPricing {
    input_per_million: 0.25,
    output_per_million: 1.25,
    cache_creation_per_million: 0.30,
    cache_read_per_million: 0.03,
};

/// Pricing resolution capability.
///
/// The static [`PriceBook`] resolves instantly and ignores the deadline. A
/// dynamic provider (network-backed rate source) may block; it must honor
/// the caller-supplied deadline and fail with
/// [`CostError::PricingUnavailable`] once it passes. Callers hold no engine
/// lock across `resolve`.
pub trait PricingSource: Send + Sync {
    fn resolve(&self, model: &str, deadline: Option<Instant>) -> Result<ModelPricing, CostError>;
}

/// Static mapping of model identifier to pricing, with a configured
/// fallback for unrecognized models.
#[derive(Debug, Clone)]
pub struct PriceBook {
    rates: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl PriceBook {
    /// An empty book that resolves everything at the fallback rate.
    pub fn empty(fallback: ModelPricing) -> Self {
        Self {
            rates: HashMap::new(),
            fallback,
        }
    }

    /// The built-in book: three assistant tiers plus dated aliases,
    /// falling back to sonnet rates.
    pub fn with_defaults() -> Self {
        Self {
            rates: default_rates(),
            fallback: SONNET_PRICING,
        }
    }

    /// Look up pricing for a model ID.
    ///
    /// Fallback chain:
    /// 1. Exact match (e.g. "claude-sonnet-4-5")
    /// 2. Key is prefix of model_id (key "claude-sonnet-4-5" matches
    ///    "claude-sonnet-4-5-20250929")
    /// 3. model_id is prefix of key ("claude-opus" matches "claude-opus-4")
    pub fn lookup(&self, model_id: &str) -> Option<&ModelPricing> {
        if let Some(p) = self.rates.get(model_id) {
            return Some(p);
        }
        for (key, p) in &self.rates {
            if model_id.starts_with(key.as_str()) {
                return Some(p);
            }
        }
        for (key, p) in &self.rates {
            if key.starts_with(model_id) {
                return Some(p);
            }
        }
        None
    }

    /// Resolve pricing, falling back to the configured default rates when
    /// the model is unrecognized.
    pub fn resolve_or_fallback(&self, model_id: &str) -> ModelPricing {
        self.lookup(model_id).copied().unwrap_or(self.fallback)
    }

    /// Replace (or insert) a model's rates. Admin call.
    pub fn update_pricing(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.rates.insert(model.into(), pricing);
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl PricingSource for PriceBook {
    fn resolve(&self, model: &str, _deadline: Option<Instant>) -> Result<ModelPricing, CostError> {
        Ok(self.resolve_or_fallback(model))
    }
}

/// Built-in rate table for offline operation.
///
/// Tier keys ("opus", "sonnet", "haiku") resolve bare tier names; dated
/// model IDs resolve through the prefix chain.
fn default_rates() -> HashMap<String, ModelPricing> {
    let mut m = HashMap::new();

    // Bare tiers
    m.insert("opus".into(), OPUS_PRICING);
    m.insert("sonnet".into(), SONNET_PRICING);
    m.insert("haiku".into(), HAIKU_PRICING);

    // Current generation
    m.insert("claude-opus-4".into(), OPUS_PRICING);
    m.insert("claude-sonnet-4-5".into(), SONNET_PRICING);
    m.insert("claude-sonnet-4".into(), SONNET_PRICING);
    m.insert("claude-haiku-4-5".into(), HAIKU_PRICING);

    // Legacy models
    m.insert("claude-3-opus".into(), OPUS_PRICING);
    m.insert("claude-3-7-sonnet".into(), SONNET_PRICING);
    m.insert("claude-3-5-sonnet".into(), SONNET_PRICING);
    m.insert(
        "claude-3-5-haiku".into(),
        ModelPricing {
            input_per_million: 0.80,
            output_per_million: 4.0,
            cache_creation_per_million: 1.0,
            cache_read_per_million: 0.08,
        },
    );
    m.insert("claude-3-haiku".into(), HAIKU_PRICING);

    m
}
