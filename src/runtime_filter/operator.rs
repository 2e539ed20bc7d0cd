/// Runtime semi-join filter operator
///
/// Sits above a probe-side scan and drops rows whose join keys are definitely
/// absent from the build side, using bloom filters published to the fragment's
/// `RuntimeFilterSink`. A missing filter never drops anything: rows pass
/// through until one arrives. The operator blocks for the filter at most once,
/// with a bounded timeout, and never on the first batch it sees.
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::{Batch, SelectionVectorMode};
use crate::execution::context::OperatorContext;
use crate::execution::evaluator::FieldHasher;
use crate::execution::iter::{drive_next, BatchOperator, IterOutcome, ProtocolState, SingleInputOperator};
use crate::execution::selection::SelectionVector2;
use crate::execution::stats::{MetricDef, OperatorStats};
use crate::runtime_filter::writable::RuntimeFilterWritable;
use arrow::datatypes::SchemaRef;
use bitvec::prelude::{bitvec, BitVec, Lsb0};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy)]
pub enum RuntimeFilterMetric {
    /// Rows dropped by the filter
    FilteredRows,
    /// Batches the filter was actually applied to
    AppliedTimes,
    /// Milliseconds spent waiting for the filter
    WaitTimeMs,
}

impl MetricDef for RuntimeFilterMetric {
    fn metric_name(&self) -> &'static str {
        match self {
            RuntimeFilterMetric::FilteredRows => "FILTERED_ROWS",
            RuntimeFilterMetric::AppliedTimes => "APPLIED_TIMES",
            RuntimeFilterMetric::WaitTimeMs => "WAIT_TIME_MS",
        }
    }
}

pub struct RuntimeFilterOperator {
    context: OperatorContext,
    incoming: Box<dyn BatchOperator>,
    identifier: i64,
    probe_fields: Vec<String>,
    hashers: Vec<FieldHasher>,
    current: Option<Arc<RuntimeFilterWritable>>,
    incoming_schema: Option<SchemaRef>,
    outgoing: Batch,
    protocol: ProtocolState,
    wait_enabled: bool,
    max_wait: Duration,
    waited: bool,
    batch_times: u64,
    filtered_rows: u64,
    applied_times: u64,
}

impl RuntimeFilterOperator {
    pub fn new(
        context: OperatorContext,
        incoming: Box<dyn BatchOperator>,
        identifier: i64,
        probe_fields: Vec<String>,
    ) -> Self {
        let options = &context.options().runtime_filter;
        let wait_enabled = options.wait_enabled;
        let max_wait = Duration::from_millis(options.max_wait_ms);
        let outgoing = Batch::empty(incoming.batch().schema().clone());
        Self {
            context,
            incoming,
            identifier,
            probe_fields,
            hashers: Vec::new(),
            current: None,
            incoming_schema: None,
            outgoing,
            protocol: ProtocolState::new(),
            wait_enabled,
            max_wait,
            waited: false,
            batch_times: 0,
            filtered_rows: 0,
            applied_times: 0,
        }
    }

    pub fn stats(&self) -> &Arc<OperatorStats> {
        self.context.stats()
    }

    pub fn filtered_rows(&self) -> u64 {
        self.filtered_rows
    }

    pub fn applied_times(&self) -> u64 {
        self.applied_times
    }

    pub fn has_filter(&self) -> bool {
        self.current.is_some()
    }

    /// Bind one hasher per field of `fields` to the current schema
    fn bind_hashers(&mut self, fields: &[String]) -> EngineResult<()> {
        let schema = self
            .incoming_schema
            .clone()
            .ok_or_else(|| EngineError::internal("runtime filter used before schema setup"))?;
        let mut hashers = Vec::with_capacity(fields.len());
        for field in fields {
            let mut hasher = FieldHasher::single(field.clone());
            hasher.bind_schema(&schema)?;
            hashers.push(hasher);
        }
        self.hashers = hashers;
        Ok(())
    }

    /// Look the filter up, blocking once (bounded) if it is still missing
    fn acquire_filter(&mut self, may_wait: bool) -> EngineResult<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let sink = Arc::clone(self.context.fragment().runtime_filters());
        let mut found = sink.get(self.identifier);
        if found.is_none() && self.wait_enabled && !self.waited && may_wait {
            let start = Instant::now();
            found = self
                .context
                .stats()
                .time_wait(|| sink.wait_for(self.identifier, self.max_wait));
            self.waited = true;
            let waited_ms = start.elapsed().as_millis() as i64;
            self.context
                .stats()
                .add_long_stat(&RuntimeFilterMetric::WaitTimeMs, waited_ms);
            debug!(
                operator = self.context.name(),
                identifier = self.identifier,
                waited_ms = waited_ms,
                arrived = found.is_some(),
                "Waited for runtime filter"
            );
        }
        if let Some(rf) = found {
            if rf.probe_fields() != self.probe_fields.as_slice() {
                debug!(
                    operator = self.context.name(),
                    configured = ?self.probe_fields,
                    published = ?rf.probe_fields(),
                    "Runtime filter probe fields differ from configuration"
                );
                self.probe_fields = rf.probe_fields().to_vec();
            }
            let fields = self.probe_fields.clone();
            self.bind_hashers(&fields)?;
            info!(
                operator = self.context.name(),
                identifier = self.identifier,
                fields = ?fields,
                "Runtime filter arrived"
            );
            self.current = Some(rf);
        }
        Ok(())
    }

    /// Fill `sv` with surviving rows; returns the survivor count
    fn apply(&mut self, sv: &mut SelectionVector2) -> EngineResult<usize> {
        let incoming = self.incoming.batch();
        let record_count = incoming.record_count();
        sv.ensure_capacity(self.context.accountant(), record_count)?;

        let Some(rf) = self.current.as_ref() else {
            // pass everything through
            let slots = sv.slots_mut()?;
            for (slot, row) in slots.iter_mut().zip(incoming.visible_rows()) {
                *slot = row as u16;
            }
            return Ok(record_count);
        };

        for hasher in self.hashers.iter_mut() {
            hasher.bind_columns(incoming)?;
        }
        let slots = sv.slots_mut()?;
        let mut survivors = 0;
        if self.hashers.len() == 1 {
            let (Some(bloom), Some(hasher)) = (rf.bloom_filters().first(), self.hashers.first())
            else {
                return Err(EngineError::internal("runtime filter has no bloom filter"));
            };
            for row in incoming.visible_rows() {
                if bloom.might_contain_hash(hasher.hash_row(row)) {
                    slots[survivors] = row as u16;
                    survivors += 1;
                }
            }
        } else {
            let mut hits: BitVec<u64, Lsb0> = bitvec![u64, Lsb0; 1; record_count];
            for (hasher, bloom) in self.hashers.iter().zip(rf.bloom_filters()) {
                let mut field_hits: BitVec<u64, Lsb0> = BitVec::with_capacity(record_count);
                for row in incoming.visible_rows() {
                    field_hits.push(bloom.might_contain_hash(hasher.hash_row(row)));
                }
                hits &= field_hits;
            }
            for position in hits.iter_ones() {
                slots[survivors] = incoming.row_at(position) as u16;
                survivors += 1;
            }
        }

        self.applied_times += 1;
        self.filtered_rows += (record_count - survivors) as u64;
        let stats = self.context.stats();
        stats.add_long_stat(&RuntimeFilterMetric::AppliedTimes, 1);
        stats.add_long_stat(
            &RuntimeFilterMetric::FilteredRows,
            (record_count - survivors) as i64,
        );
        Ok(survivors)
    }
}

impl BatchOperator for RuntimeFilterOperator {
    fn next(&mut self) -> EngineResult<IterOutcome> {
        drive_next(self)
    }

    fn batch(&self) -> &Batch {
        &self.outgoing
    }

    fn kill(&mut self, send_upstream: bool) {
        self.incoming.kill(send_upstream);
    }

    fn close(&mut self) -> EngineResult<()> {
        if let Some(mut sv) = self.outgoing.take_selection_vector() {
            sv.clear();
        }
        self.incoming.close()?;
        info!(
            operator = self.context.name(),
            identifier = self.identifier,
            filtered_rows = self.filtered_rows,
            applied_times = self.applied_times,
            "Runtime filter closed"
        );
        self.context.close()
    }

    fn name(&self) -> &str {
        self.context.name()
    }
}

impl SingleInputOperator for RuntimeFilterOperator {
    fn protocol(&self) -> &ProtocolState {
        &self.protocol
    }

    fn protocol_mut(&mut self) -> &mut ProtocolState {
        &mut self.protocol
    }

    fn incoming(&self) -> &dyn BatchOperator {
        self.incoming.as_ref()
    }

    fn incoming_mut(&mut self) -> &mut dyn BatchOperator {
        self.incoming.as_mut()
    }

    fn context(&self) -> &OperatorContext {
        &self.context
    }

    fn setup_new_schema(&mut self) -> EngineResult<bool> {
        let incoming = self.incoming.batch();
        if incoming.selection_mode() == SelectionVectorMode::FourByte {
            return Err(EngineError::schema_change_in(
                "runtime filter does not accept four-byte selection vectors",
                self.context.name(),
            ));
        }
        let schema = incoming.schema().clone();
        if let Some(mut sv) = self.outgoing.take_selection_vector() {
            sv.clear();
        }
        self.outgoing = Batch::empty(schema.clone());
        self.incoming_schema = Some(schema);
        let fields = self.probe_fields.clone();
        self.bind_hashers(&fields)
            .map_err(|e| e.with_context(format!("runtime filter '{}'", self.context.name())))?;
        Ok(true)
    }

    fn do_work(&mut self) -> EngineResult<IterOutcome> {
        if self.incoming.batch().selection_mode() == SelectionVectorMode::FourByte {
            return Err(EngineError::schema_change_in(
                "runtime filter does not accept four-byte selection vectors",
                self.context.name(),
            ));
        }
        let mut sv = self.outgoing.take_selection_vector().unwrap_or_default();
        let record_count = self.incoming.batch().record_count();
        // every batch counts, so only the fast-schema batch skips the wait
        let seen_before = self.batch_times;
        self.batch_times += 1;
        if record_count > 0 {
            self.acquire_filter(seen_before > 0)?;
            match self.apply(&mut sv) {
                Ok(survivors) => sv.set_record_count(survivors)?,
                Err(e) if e.is_out_of_memory() => return Ok(IterOutcome::OutOfMemory),
                Err(e) => return Err(e),
            }
        } else if sv.is_allocated() {
            sv.set_record_count(0)?;
        }

        let incoming = self.incoming.batch();
        sv.set_batch_actual_record_count(incoming.row_count());
        self.context.stats().record_batch(sv.count());
        trace!(
            operator = self.context.name(),
            rows_in = record_count,
            rows_out = sv.count(),
            "Runtime filter batch"
        );
        self.outgoing = Batch::transfer_with_selection(incoming, sv);
        Ok(self.protocol.final_outcome(false))
    }
}
