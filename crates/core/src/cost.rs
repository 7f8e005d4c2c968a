// crates/core/src/cost.rs
//! Cost calculator: turns raw token counts into monetary values.
//!
//! Stateless over a [`PricingSource`]: the static price book by default, a
//! dynamic provider when configured. All produced cost figures are rounded
//! to 6 decimal places with banker's rounding.

use crate::error::CostError;
use crate::pricing::{ModelPricing, PricingSource};
use crate::types::{TokenCounts, UsageEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Round to 6 decimal places, ties to even (banker's rounding).
///
/// Idempotent: re-rounding an already-rounded value returns it unchanged.
pub fn round6(value: f64) -> f64 {
    const SCALE: f64 = 1_000_000.0;
    let scaled = value * SCALE;
    let floor = scaled.floor();
    let frac = scaled - floor;
    let tolerance = f64::EPSILON * scaled.abs().max(1.0);
    let rounded = if (frac - 0.5).abs() <= tolerance {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else if frac > 0.5 {
        floor + 1.0
    } else {
        floor
    };
    rounded / SCALE
}

/// Itemized cost for a single entry (or an accumulated batch), USD.
///
/// Invariant: `total_cost` equals the sum of the four class costs within
/// 1e-6; every field is stable under re-rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostResult {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
}

impl CostResult {
    fn from_tokens(entry: &UsageEntry, pricing: &ModelPricing) -> Self {
        const MILLION: f64 = 1_000_000.0;
        let input_cost = round6(entry.input_tokens as f64 * pricing.input_per_million / MILLION);
        let output_cost = round6(entry.output_tokens as f64 * pricing.output_per_million / MILLION);
        let cache_creation_cost = round6(
            entry.cache_creation_tokens as f64 * pricing.cache_creation_per_million / MILLION,
        );
        let cache_read_cost =
            round6(entry.cache_read_tokens as f64 * pricing.cache_read_per_million / MILLION);
        let total_cost = round6(input_cost + output_cost + cache_creation_cost + cache_read_cost);
        Self {
            input_cost,
            output_cost,
            cache_creation_cost,
            cache_read_cost,
            total_cost,
        }
    }

    fn accumulate(&mut self, other: &CostResult) {
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.cache_creation_cost += other.cache_creation_cost;
        self.cache_read_cost += other.cache_read_cost;
        self.total_cost += other.total_cost;
    }

    fn rounded(mut self) -> Self {
        self.input_cost = round6(self.input_cost);
        self.output_cost = round6(self.output_cost);
        self.cache_creation_cost = round6(self.cache_creation_cost);
        self.cache_read_cost = round6(self.cache_read_cost);
        self.total_cost = round6(self.total_cost);
        self
    }

    fn scaled(self, rate: f64) -> Self {
        Self {
            input_cost: round6(self.input_cost * rate),
            output_cost: round6(self.output_cost * rate),
            cache_creation_cost: round6(self.cache_creation_cost * rate),
            cache_read_cost: round6(self.cache_read_cost * rate),
            total_cost: round6(self.total_cost * rate),
        }
    }
}

/// Per-model accumulation inside a batch result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCostAggregate {
    pub tokens: TokenCounts,
    pub costs: CostResult,
    pub entries_count: u32,
}

/// Aggregated cost over a batch of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCostResult {
    pub entry_count: usize,
    pub tokens: TokenCounts,
    pub costs: CostResult,
    pub per_model: HashMap<String, ModelCostAggregate>,
}

/// Result of comparing the same token load across two models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostComparison {
    pub cost_a: f64,
    pub cost_b: f64,
    /// Absolute difference between the two costs.
    pub difference: f64,
    /// `max − min`: what switching to the cheaper model saves.
    pub savings: f64,
}

/// Stateless cost calculator over a pricing source and a currency table.
///
/// The engine never fetches currency rates; they are injected via
/// [`update_currency_rate`](CostCalculator::update_currency_rate).
pub struct CostCalculator {
    source: Arc<dyn PricingSource>,
    currency_rates: HashMap<String, f64>,
}

impl CostCalculator {
    pub fn new(source: Arc<dyn PricingSource>) -> Self {
        let mut currency_rates = HashMap::new();
        currency_rates.insert("USD".to_string(), 1.0);
        Self {
            source,
            currency_rates,
        }
    }

    /// Cost a single entry in USD.
    ///
    /// Fails with [`CostError::EmptyModel`] when the entry's model
    /// identifier is blank; pricing resolution falls back to sonnet-tier
    /// rates for unrecognized models.
    pub fn calculate(&self, entry: &UsageEntry) -> Result<CostResult, CostError> {
        self.calculate_with_deadline(entry, None)
    }

    /// Cost a single entry, bounding any dynamic pricing-provider call by
    /// `deadline`.
    pub fn calculate_with_deadline(
        &self,
        entry: &UsageEntry,
        deadline: Option<Instant>,
    ) -> Result<CostResult, CostError> {
        if entry.model.trim().is_empty() {
            return Err(CostError::EmptyModel);
        }
        let pricing = self.source.resolve(&entry.model, deadline)?;
        Ok(CostResult::from_tokens(entry, &pricing))
    }

    /// Cost a batch, accumulating per-model and in total.
    ///
    /// Fails with [`CostError::EmptyBatch`] on empty input; an error on any
    /// individual entry aborts the whole batch.
    pub fn calculate_batch(&self, entries: &[UsageEntry]) -> Result<BatchCostResult, CostError> {
        self.calculate_batch_with_deadline(entries, None)
    }

    pub fn calculate_batch_with_deadline(
        &self,
        entries: &[UsageEntry],
        deadline: Option<Instant>,
    ) -> Result<BatchCostResult, CostError> {
        if entries.is_empty() {
            return Err(CostError::EmptyBatch);
        }

        let mut result = BatchCostResult {
            entry_count: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let costs = self.calculate_with_deadline(entry, deadline)?;
            result.tokens.add_entry(entry);
            result.costs.accumulate(&costs);

            let per_model = result.per_model.entry(entry.model.clone()).or_default();
            per_model.tokens.add_entry(entry);
            per_model.costs.accumulate(&costs);
            per_model.entries_count += 1;
        }
        for aggregate in result.per_model.values_mut() {
            aggregate.costs = aggregate.costs.rounded();
        }
        result.costs = result.costs.rounded();
        Ok(result)
    }

    /// Cost a single entry, converted into `currency`.
    ///
    /// Fails with [`CostError::UnsupportedCurrency`] when no rate is
    /// configured for `currency`.
    pub fn calculate_with_currency(
        &self,
        entry: &UsageEntry,
        currency: &str,
    ) -> Result<CostResult, CostError> {
        let rate = *self
            .currency_rates
            .get(currency)
            .ok_or_else(|| CostError::unsupported_currency(currency))?;
        let usd = self.calculate(entry)?;
        Ok(usd.scaled(rate))
    }

    /// Set the USD → `currency` conversion rate.
    ///
    /// Fails with [`CostError::NonPositiveRate`] when `rate <= 0`.
    pub fn update_currency_rate(
        &mut self,
        currency: impl Into<String>,
        rate: f64,
    ) -> Result<(), CostError> {
        if rate <= 0.0 {
            return Err(CostError::NonPositiveRate { rate });
        }
        self.currency_rates.insert(currency.into(), rate);
        Ok(())
    }

    /// Compare the cost of an input-only load of `tokens` across two models.
    pub fn compare_costs(
        &self,
        tokens: u64,
        model_a: &str,
        model_b: &str,
    ) -> Result<CostComparison, CostError> {
        let cost_for = |model: &str| -> Result<f64, CostError> {
            if model.trim().is_empty() {
                return Err(CostError::EmptyModel);
            }
            let pricing = self.source.resolve(model, None)?;
            Ok(round6(tokens as f64 * pricing.input_per_million / 1_000_000.0))
        };
        let cost_a = cost_for(model_a)?;
        let cost_b = cost_for(model_b)?;
        Ok(CostComparison {
            cost_a,
            cost_b,
            difference: round6((cost_a - cost_b).abs()),
            savings: round6(cost_a.max(cost_b) - cost_a.min(cost_b)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PriceBook;
    use chrono::{TimeZone, Utc};

    fn calculator() -> CostCalculator {
        CostCalculator::new(Arc::new(PriceBook::with_defaults()))
    }

    fn entry(model: &str, input: u64, output: u64, create: u64, read: u64) -> UsageEntry {
        UsageEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            model: model.to_string(),
            input_tokens: input,
            output_tokens: output,
            cache_creation_tokens: create,
            cache_read_tokens: read,
            cost_usd: 0.0,
        }
    }

    #[test]
    fn test_round6_ties_to_even() {
        assert_eq!(round6(0.000_000_5), 0.0);
        assert_eq!(round6(0.000_001_5), 0.000_002);
        assert_eq!(round6(0.000_002_5), 0.000_002);
    }

    #[test]
    fn test_round6_idempotent() {
        for v in [0.0091234567, 1.2345675, 0.33333333333, 42.0] {
            let once = round6(v);
            assert_eq!(round6(once), once);
        }
    }

    #[test]
    fn test_calculate_sonnet_input_only() {
        let calc = calculator();
        // 3000 tokens at $3/M = $0.009
        let result = calc.calculate(&entry("sonnet", 3000, 0, 0, 0)).unwrap();
        assert!((result.input_cost - 0.009).abs() < 1e-9);
        assert!((result.total_cost - 0.009).abs() < 1e-9);
        assert_eq!(result.output_cost, 0.0);
    }

    #[test]
    fn test_calculate_all_classes_sum() {
        let calc = calculator();
        let result = calc
            .calculate(&entry("claude-opus-4", 100_000, 10_000, 5_000, 200_000))
            .unwrap();
        let sum = result.input_cost
            + result.output_cost
            + result.cache_creation_cost
            + result.cache_read_cost;
        assert!((result.total_cost - sum).abs() < 1e-6);
    }

    #[test]
    fn test_calculate_empty_model() {
        let calc = calculator();
        let err = calc.calculate(&entry("  ", 100, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, CostError::EmptyModel));
    }

    #[test]
    fn test_calculate_unknown_model_uses_fallback() {
        let calc = calculator();
        // Fallback is sonnet: 1M input tokens = $3
        let result = calc.calculate(&entry("gpt-4o", 1_000_000, 0, 0, 0)).unwrap();
        assert!((result.input_cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_batch_empty() {
        let calc = calculator();
        let err = calc.calculate_batch(&[]).unwrap_err();
        assert!(matches!(err, CostError::EmptyBatch));
    }

    #[test]
    fn test_batch_per_model_accumulation() {
        let calc = calculator();
        let entries = vec![
            entry("sonnet", 1000, 0, 0, 0),
            entry("sonnet", 2000, 0, 0, 0),
            entry("opus", 1000, 0, 0, 0),
        ];
        let batch = calc.calculate_batch(&entries).unwrap();
        assert_eq!(batch.entry_count, 3);
        assert_eq!(batch.tokens.input_tokens, 4000);
        assert_eq!(batch.per_model.len(), 2);

        let sonnet = &batch.per_model["sonnet"];
        assert_eq!(sonnet.entries_count, 2);
        assert_eq!(sonnet.tokens.input_tokens, 3000);
        assert!((sonnet.costs.total_cost - 0.009).abs() < 1e-9);

        let opus = &batch.per_model["opus"];
        assert!((opus.costs.total_cost - 0.015).abs() < 1e-9);
        assert!((batch.costs.total_cost - 0.024).abs() < 1e-9);
    }

    #[test]
    fn test_batch_aborts_on_bad_entry() {
        let calc = calculator();
        let entries = vec![entry("sonnet", 1000, 0, 0, 0), entry("", 500, 0, 0, 0)];
        let err = calc.calculate_batch(&entries).unwrap_err();
        assert!(matches!(err, CostError::EmptyModel));
    }

    #[test]
    fn test_currency_conversion() {
        let mut calc = calculator();
        calc.update_currency_rate("EUR", 0.9).unwrap();
        let usd = calc.calculate(&entry("sonnet", 1_000_000, 0, 0, 0)).unwrap();
        let eur = calc
            .calculate_with_currency(&entry("sonnet", 1_000_000, 0, 0, 0), "EUR")
            .unwrap();
        assert!((eur.total_cost - usd.total_cost * 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_currency_unsupported() {
        let calc = calculator();
        let err = calc
            .calculate_with_currency(&entry("sonnet", 100, 0, 0, 0), "GBP")
            .unwrap_err();
        assert!(matches!(err, CostError::UnsupportedCurrency { .. }));
    }

    #[test]
    fn test_currency_usd_is_identity() {
        let calc = calculator();
        let usd = calc.calculate(&entry("sonnet", 123_456, 0, 0, 0)).unwrap();
        let explicit = calc
            .calculate_with_currency(&entry("sonnet", 123_456, 0, 0, 0), "USD")
            .unwrap();
        assert_eq!(usd, explicit);
    }

    #[test]
    fn test_update_currency_rejects_non_positive() {
        let mut calc = calculator();
        assert!(matches!(
            calc.update_currency_rate("EUR", 0.0).unwrap_err(),
            CostError::NonPositiveRate { .. }
        ));
        assert!(matches!(
            calc.update_currency_rate("EUR", -2.0).unwrap_err(),
            CostError::NonPositiveRate { .. }
        ));
    }

    #[test]
    fn test_compare_costs() {
        let calc = calculator();
        // 1M input tokens: opus $15 vs sonnet $3
        let cmp = calc.compare_costs(1_000_000, "opus", "sonnet").unwrap();
        assert!((cmp.cost_a - 15.0).abs() < 1e-9);
        assert!((cmp.cost_b - 3.0).abs() < 1e-9);
        assert!((cmp.difference - 12.0).abs() < 1e-9);
        assert!((cmp.savings - 12.0).abs() < 1e-9);
    }

    /// Provider double that fails once its deadline has passed.
    struct DeadlineProvider {
        pricing: ModelPricing,
    }

    impl PricingSource for DeadlineProvider {
        fn resolve(
            &self,
            model: &str,
            deadline: Option<Instant>,
        ) -> Result<ModelPricing, CostError> {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(CostError::pricing_unavailable(model, "deadline exceeded"));
                }
            }
            Ok(self.pricing)
        }
    }

    #[test]
    fn test_provider_deadline_fails_batch() {
        let calc = CostCalculator::new(Arc::new(DeadlineProvider {
            pricing: crate::pricing::SONNET_PRICING,
        }));
        let entries = vec![entry("sonnet", 1000, 0, 0, 0)];

        let expired = Instant::now() - std::time::Duration::from_secs(1);
        let err = calc
            .calculate_batch_with_deadline(&entries, Some(expired))
            .unwrap_err();
        assert!(matches!(err, CostError::PricingUnavailable { .. }));

        let future = Instant::now() + std::time::Duration::from_secs(60);
        let batch = calc
            .calculate_batch_with_deadline(&entries, Some(future))
            .unwrap();
        assert!((batch.costs.total_cost - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_rounded_fields_stable() {
        let calc = calculator();
        let result = calc.calculate(&entry("haiku", 333_333, 77_777, 11, 7)).unwrap();
        for field in [
            result.input_cost,
            result.output_cost,
            result.cache_creation_cost,
            result.cache_read_cost,
            result.total_cost,
        ] {
            assert_eq!(round6(field), field);
        }
    }
}
