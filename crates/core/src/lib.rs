// crates/core/src/lib.rs
pub mod blocks;
pub mod burnrate;
pub mod cost;
pub mod error;
pub mod p90;
pub mod pricing;
pub mod types;

pub use blocks::*;
pub use burnrate::*;
pub use cost::*;
pub use error::*;
pub use p90::*;
pub use pricing::*;
pub use types::*;
