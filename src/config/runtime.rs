/// Runtime option registry consumed by operators
///
/// Groups the numeric knobs the exchange, runtime filter and memory layers read
/// at construction time. Everything is serde-(de)serializable so a coordinator
/// can ship the option set to a fragment as JSON.
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime options for one fragment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Hash exchange sizing and batching
    pub exchange: ExchangeOptions,

    /// Runtime semi-join filter waiting policy
    pub runtime_filter: RuntimeFilterOptions,

    /// Memory accounting limits and leniency
    pub memory: MemoryOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    /// Rows per parallel slice
    pub slice_target: u64,

    /// Divisor applied when sizing sender parallelism
    pub thread_factor: u32,

    /// Upper bound on partitioner workers
    pub max_sender_threads: usize,

    /// Forces an exact worker count when > 0
    pub imposed_sender_threads: usize,

    /// Rows accumulated per outgoing buffer before it is flushed
    pub outgoing_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFilterOptions {
    /// Whether a probe may block waiting for its bloom filter
    pub wait_enabled: bool,

    /// Upper bound of that wait in milliseconds
    pub max_wait_ms: u64,
}

/// Process-wide override of the allocation leniency default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeniencyOverride {
    #[default]
    Unset,
    ForceLenient,
    ForceStrict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Leniency used when no override is set
    pub lenient_allocation: bool,

    pub leniency_override: LeniencyOverride,

    /// Fraction of the limit granted as grace in lenient mode
    pub grace_margin: f64,

    /// Absolute cap on the grace (bytes)
    pub max_grace_bytes: u64,

    /// Limit of the query root accountant (bytes)
    pub query_limit_bytes: u64,

    /// Reservation each operator draws from its parent (bytes)
    pub operator_initial_reservation: u64,

    /// Limit of each operator accountant (bytes)
    pub operator_max_allocation: u64,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            slice_target: 100_000,
            thread_factor: 2,
            max_sender_threads: num_cpus::get().clamp(1, 8),
            imposed_sender_threads: 0,
            outgoing_batch_size: 1024,
        }
    }
}

impl Default for RuntimeFilterOptions {
    fn default() -> Self {
        Self {
            wait_enabled: true,
            max_wait_ms: 300,
        }
    }
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            lenient_allocation: false,
            leniency_override: LeniencyOverride::Unset,
            grace_margin: 0.10,
            max_grace_bytes: 100 * 1024 * 1024, // 100MB
            query_limit_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            operator_initial_reservation: 1_000_000,
            operator_max_allocation: 10_000_000_000,
        }
    }
}

impl RuntimeOptions {
    /// Parse options from a JSON document; missing keys take their defaults
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::io_with_path(e.to_string(), path.display().to_string())
        })?;
        Self::from_json_str(&contents)
    }

    /// Reject option combinations the operators cannot work with
    pub fn validate(&self) -> EngineResult<()> {
        if self.exchange.thread_factor == 0 {
            return Err(EngineError::config(
                "thread factor must be positive",
                "exchange.thread_factor",
            ));
        }
        if self.exchange.max_sender_threads == 0 {
            return Err(EngineError::config(
                "at least one sender thread is required",
                "exchange.max_sender_threads",
            ));
        }
        if self.exchange.outgoing_batch_size == 0 {
            return Err(EngineError::config(
                "outgoing batch size must be positive",
                "exchange.outgoing_batch_size",
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.grace_margin) {
            return Err(EngineError::config(
                format!("grace margin {} outside [0, 1]", self.memory.grace_margin),
                "memory.grace_margin",
            ));
        }
        if self.memory.operator_initial_reservation > self.memory.operator_max_allocation {
            return Err(EngineError::config(
                format!(
                    "operator reservation {} exceeds operator limit {}",
                    self.memory.operator_initial_reservation, self.memory.operator_max_allocation
                ),
                "memory.operator_initial_reservation",
            ));
        }
        Ok(())
    }
}
