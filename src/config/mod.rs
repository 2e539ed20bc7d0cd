/// Configuration management
pub mod runtime;

pub use runtime::*;
