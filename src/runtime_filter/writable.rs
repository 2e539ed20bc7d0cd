/// Shippable runtime filter: one bloom filter per probe field
use crate::error::{EngineError, EngineResult};
use crate::runtime_filter::bloom_filter::BloomFilter;
use serde::{Deserialize, Serialize};

/// Bloom filters for one exchange point, paired with the probe-side fields
/// they test. `bloom_filters[i]` holds the build-side key hashes matching
/// `probe_fields[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRuntimeFilter")]
pub struct RuntimeFilterWritable {
    identifier: i64,
    probe_fields: Vec<String>,
    bloom_filters: Vec<BloomFilter>,
}

/// Decoded form, checked by `RuntimeFilterWritable::new` before use
#[derive(Deserialize)]
struct WireRuntimeFilter {
    identifier: i64,
    probe_fields: Vec<String>,
    bloom_filters: Vec<BloomFilter>,
}

impl TryFrom<WireRuntimeFilter> for RuntimeFilterWritable {
    type Error = EngineError;

    fn try_from(wire: WireRuntimeFilter) -> EngineResult<Self> {
        Self::new(wire.identifier, wire.probe_fields, wire.bloom_filters)
    }
}

impl RuntimeFilterWritable {
    pub fn new(
        identifier: i64,
        probe_fields: Vec<String>,
        bloom_filters: Vec<BloomFilter>,
    ) -> EngineResult<Self> {
        if probe_fields.is_empty() {
            return Err(EngineError::setup(format!(
                "runtime filter {} has no probe fields",
                identifier
            )));
        }
        if probe_fields.len() != bloom_filters.len() {
            return Err(EngineError::setup(format!(
                "runtime filter {} has {} probe fields but {} bloom filters",
                identifier,
                probe_fields.len(),
                bloom_filters.len()
            )));
        }
        if let Some(position) = bloom_filters.iter().position(|b| b.num_bits() == 0) {
            return Err(EngineError::setup(format!(
                "runtime filter {} bloom filter for '{}' has no bits",
                identifier, probe_fields[position]
            )));
        }
        Ok(Self {
            identifier,
            probe_fields,
            bloom_filters,
        })
    }

    pub fn identifier(&self) -> i64 {
        self.identifier
    }

    pub fn probe_fields(&self) -> &[String] {
        &self.probe_fields
    }

    pub fn bloom_filters(&self) -> &[BloomFilter] {
        &self.bloom_filters
    }

    /// OR another partial filter for the same exchange point into this one
    pub fn aggregate(&mut self, other: &RuntimeFilterWritable) -> EngineResult<()> {
        if self.identifier != other.identifier || self.probe_fields != other.probe_fields {
            return Err(EngineError::execution(format!(
                "cannot aggregate runtime filter {} {:?} with {} {:?}",
                self.identifier, self.probe_fields, other.identifier, other.probe_fields
            )));
        }
        for (mine, theirs) in self.bloom_filters.iter_mut().zip(&other.bloom_filters) {
            mine.merge(theirs)?;
        }
        Ok(())
    }

    pub fn memory_usage_bytes(&self) -> usize {
        self.bloom_filters.iter().map(|b| b.memory_usage_bytes()).sum()
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            EngineError::setup(format!("invalid runtime filter message: {}", e))
        })
    }
}
