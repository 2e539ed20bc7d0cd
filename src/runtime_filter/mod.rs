/// Runtime semi-join filters: bloom filters built from join build sides and
/// applied to probe-side scans
pub mod bloom_filter;
pub mod builder;
pub mod operator;
pub mod sink;
pub mod writable;

pub use bloom_filter::BloomFilter;
pub use builder::RuntimeFilterBuilder;
pub use operator::{RuntimeFilterMetric, RuntimeFilterOperator};
pub use sink::RuntimeFilterSink;
pub use writable::RuntimeFilterWritable;
