/// Build-side helper: hash join keys into a runtime filter
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::Batch;
use crate::execution::evaluator::FieldHasher;
use crate::runtime_filter::bloom_filter::BloomFilter;
use crate::runtime_filter::writable::RuntimeFilterWritable;

/// Accumulates build-side key hashes, one bloom filter per key field.
///
/// `build_fields[i]` is hashed into the filter tested against
/// `probe_fields[i]` on the probe side.
#[derive(Debug)]
pub struct RuntimeFilterBuilder {
    identifier: i64,
    probe_fields: Vec<String>,
    hashers: Vec<FieldHasher>,
    filters: Vec<BloomFilter>,
}

impl RuntimeFilterBuilder {
    pub fn new(
        identifier: i64,
        build_fields: Vec<String>,
        probe_fields: Vec<String>,
        expected_keys: usize,
        fpp: f64,
    ) -> EngineResult<Self> {
        if build_fields.is_empty() || build_fields.len() != probe_fields.len() {
            return Err(EngineError::setup(format!(
                "runtime filter {} needs matching build/probe fields, got {:?} / {:?}",
                identifier, build_fields, probe_fields
            )));
        }
        let filters = build_fields
            .iter()
            .map(|_| BloomFilter::with_expected(expected_keys, fpp))
            .collect();
        Ok(Self {
            identifier,
            probe_fields,
            hashers: build_fields.into_iter().map(FieldHasher::single).collect(),
            filters,
        })
    }

    /// Hash every visible row of `batch`
    pub fn insert_batch(&mut self, batch: &Batch) -> EngineResult<()> {
        for (hasher, filter) in self.hashers.iter_mut().zip(self.filters.iter_mut()) {
            hasher.bind_schema(batch.schema())?;
            hasher.bind_columns(batch)?;
            for row in batch.visible_rows() {
                filter.insert_hash(hasher.hash_row(row));
            }
        }
        Ok(())
    }

    pub fn finish(self) -> EngineResult<RuntimeFilterWritable> {
        RuntimeFilterWritable::new(self.identifier, self.probe_fields, self.filters)
    }
}
