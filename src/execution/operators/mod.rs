/// Single-input operators built on the batch protocol
pub mod filter;

pub use filter::{FilterMetric, FilterOperator};
