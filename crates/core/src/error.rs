// crates/core/src/error.rs
use thiserror::Error;

/// Errors raised by the cost calculator and pricing resolution.
///
/// Every variant fails the single operation that raised it; no calculator
/// state is mutated on the error path.
#[derive(Debug, Error)]
pub enum CostError {
    #[error("usage entry has an empty model identifier")]
    EmptyModel,

    #[error("cannot cost an empty batch of entries")]
    EmptyBatch,

    #[error("no conversion rate configured for currency: {currency}")]
    UnsupportedCurrency { currency: String },

    #[error("currency rate must be positive, got {rate}")]
    NonPositiveRate { rate: f64 },

    #[error("pricing provider unavailable for model {model}: {reason}")]
    PricingUnavailable { model: String, reason: String },
}

impl CostError {
    pub fn unsupported_currency(currency: impl Into<String>) -> Self {
        Self::UnsupportedCurrency {
            currency: currency.into(),
        }
    }

    pub fn pricing_unavailable(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PricingUnavailable {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_error_display() {
        let err = CostError::unsupported_currency("XYZ");
        assert!(err.to_string().contains("XYZ"));

        let err = CostError::NonPositiveRate { rate: -1.5 };
        assert!(err.to_string().contains("-1.5"));
    }

    #[test]
    fn test_pricing_unavailable_display() {
        let err = CostError::pricing_unavailable("claude-sonnet-4-5", "deadline exceeded");
        let msg = err.to_string();
        assert!(msg.contains("claude-sonnet-4-5"));
        assert!(msg.contains("deadline exceeded"));
    }
}
