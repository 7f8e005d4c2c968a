// crates/engine/src/error.rs
use thiserror::Error;

/// Errors raised by the aggregation engine.
///
/// Each variant fails the single `aggregate` call that raised it; the
/// engine's entry set and caches are untouched on the error path.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("unsupported aggregation view: {view}")]
    UnsupportedView { view: String },
}

impl AggregationError {
    pub fn unsupported_view(view: impl Into<String>) -> Self {
        Self::UnsupportedView { view: view.into() }
    }
}
