/// Hash exchange sender
///
/// Fragment root that fans each incoming batch out to `R` receivers by
/// `|hash(partition fields) mod R|`. Sender parallelism is sized once from the
/// upstream cost estimate; every worker owns a contiguous slice of receivers.
///
/// Protocol handling:
/// - first schema: one empty "fast schema" batch goes to every receiver
/// - new schema: buffers are flushed, then workers are rebuilt for it
/// - upstream NONE: remaining buffers are flushed as last batches
/// - once every receiver reported it is finished, upstream is killed
use crate::distributed::decorator::PartitionerDecorator;
use crate::distributed::message::{ExchangeRoute, FragmentWritableBatch};
use crate::distributed::partitioner::HashPartitioner;
use crate::distributed::receivers::{Destination, ReceiverStatus};
use crate::distributed::sizing::{actual_sender_threads, desired_sender_threads, slice_ranges};
use crate::error::{EngineError, EngineResult};
use crate::execution::context::OperatorContext;
use crate::execution::evaluator::{partition_bucket, HashEvaluator};
use crate::execution::fragment::RootExec;
use crate::execution::iter::{BatchOperator, IterOutcome};
use crate::execution::stats::{MetricDef, OperatorStats};
use arrow::datatypes::SchemaRef;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub enum ExchangeMetric {
    NReceivers,
    BatchesSent,
    RecordsSent,
    MinRecords,
    MaxRecords,
    BytesSent,
    SendingThreadsCount,
    Cost,
}

impl MetricDef for ExchangeMetric {
    fn metric_name(&self) -> &'static str {
        match self {
            ExchangeMetric::NReceivers => "N_RECEIVERS",
            ExchangeMetric::BatchesSent => "BATCHES_SENT",
            ExchangeMetric::RecordsSent => "RECORDS_SENT",
            ExchangeMetric::MinRecords => "MIN_RECORDS",
            ExchangeMetric::MaxRecords => "MAX_RECORDS",
            ExchangeMetric::BytesSent => "BYTES_SENT",
            ExchangeMetric::SendingThreadsCount => "SENDING_THREADS_COUNT",
            ExchangeMetric::Cost => "COST",
        }
    }
}

pub struct HashExchangeSender {
    context: OperatorContext,
    incoming: Box<dyn BatchOperator>,
    hasher: Box<dyn HashEvaluator>,
    destinations: Vec<Destination>,
    status: Arc<ReceiverStatus>,
    route: ExchangeRoute,
    num_workers: usize,
    batch_size: usize,
    decorator: Option<PartitionerDecorator>,
    generation: usize,
    receiver_records: Vec<u64>,
    buckets: Vec<u32>,
    first: bool,
    done: bool,
}

impl HashExchangeSender {
    /// # Arguments
    /// * `destinations` - receivers in bucket order
    /// * `receiving_major_fragment_id` - major fragment of the receivers
    /// * `cost` - estimated upstream row count, used to size parallelism
    pub fn new(
        context: OperatorContext,
        incoming: Box<dyn BatchOperator>,
        hasher: Box<dyn HashEvaluator>,
        destinations: Vec<Destination>,
        receiving_major_fragment_id: u32,
        cost: f64,
    ) -> EngineResult<Self> {
        if destinations.is_empty() {
            return Err(EngineError::setup("hash exchange needs at least one receiver"));
        }
        let receivers = destinations.len();
        let options = &context.options().exchange;
        let desired = desired_sender_threads(cost, receivers, options);
        let num_workers = actual_sender_threads(desired, receivers);
        let batch_size = options.outgoing_batch_size;

        let handle = context.fragment().handle();
        let route = ExchangeRoute {
            query_id: handle.query_id,
            sending_major_fragment_id: handle.major_fragment_id,
            sending_minor_fragment_id: handle.minor_fragment_id,
            receiving_major_fragment_id,
        };
        let status = Arc::new(ReceiverStatus::new(
            destinations.iter().map(|d| d.minor_fragment_id).collect(),
        ));

        let stats = context.stats();
        stats.set_long_stat(&ExchangeMetric::NReceivers, receivers as i64);
        stats.set_long_stat(&ExchangeMetric::SendingThreadsCount, num_workers as i64);
        stats.set_long_stat(&ExchangeMetric::Cost, cost as i64);
        info!(
            fragment = %handle,
            receivers = receivers,
            cost = cost,
            desired_threads = desired,
            sender_threads = num_workers,
            "Hash exchange sized"
        );

        Ok(Self {
            context,
            incoming,
            hasher,
            destinations,
            status,
            route,
            num_workers,
            batch_size,
            decorator: None,
            generation: 0,
            receiver_records: vec![0; receivers],
            buckets: Vec::new(),
            first: true,
            done: false,
        })
    }

    /// Shared handle other threads use to report finished receivers
    pub fn receiver_status(&self) -> Arc<ReceiverStatus> {
        Arc::clone(&self.status)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn stats(&self) -> &OperatorStats {
        self.context.stats()
    }

    /// Rows delivered to each receiver, by receiver position
    pub fn receiver_records(&self) -> Vec<u64> {
        let mut counts = self.receiver_records.clone();
        if let Some(decorator) = &self.decorator {
            let live = decorator.outgoing_record_counts(counts.len());
            for (total, extra) in counts.iter_mut().zip(live) {
                *total += extra;
            }
        }
        counts
    }

    fn create_partitioners(&mut self, schema: &SchemaRef) -> EngineResult<()> {
        self.retire_partitioners()?;
        self.generation += 1;
        let ranges = slice_ranges(self.destinations.len(), self.num_workers);
        let mut partitioners = Vec::with_capacity(ranges.len());
        for (worker_id, range) in ranges.into_iter().enumerate() {
            let accountant = self.context.accountant().new_child(
                format!(
                    "{}:partitioner-{}.{}",
                    self.context.name(),
                    self.generation,
                    worker_id
                ),
                0,
                self.context.options().memory.operator_max_allocation,
            )?;
            partitioners.push(HashPartitioner::new(
                worker_id,
                range,
                &self.destinations,
                &self.status,
                self.route,
                schema,
                self.batch_size,
                accountant,
            ));
        }
        self.decorator = Some(PartitionerDecorator::new(partitioners)?);
        Ok(())
    }

    /// Fold the current workers' counters into the operator and drop them
    fn retire_partitioners(&mut self) -> EngineResult<()> {
        let Some(mut decorator) = self.decorator.take() else {
            return Ok(());
        };
        let counts = decorator.outgoing_record_counts(self.receiver_records.len());
        for (total, sent) in self.receiver_records.iter_mut().zip(counts) {
            *total += sent;
        }
        decorator.merge_stats(self.context.stats());
        decorator.clear()
    }

    fn partition_current(&mut self) -> EngineResult<()> {
        let incoming = self.incoming.batch();
        if incoming.record_count() == 0 {
            return Ok(());
        }
        let Some(decorator) = self.decorator.as_mut() else {
            return Err(EngineError::internal("hash exchange received data before a schema"));
        };
        self.hasher.bind(incoming)?;
        let receivers = self.destinations.len();
        self.buckets.clear();
        self.buckets.extend(
            incoming
                .visible_rows()
                .map(|row| partition_bucket(self.hasher.hash(row), receivers) as u32),
        );
        decorator.partition_batch(incoming, &self.buckets)
    }

    fn handle_new_schema(&mut self) -> EngineResult<()> {
        if let Some(decorator) = self.decorator.as_mut() {
            decorator.flush_outgoing(false)?;
        }
        let schema = self.incoming.batch().schema().clone();
        self.hasher
            .setup(&self.context, &schema)
            .map_err(|e| e.with_context(format!("hash exchange '{}'", self.context.name())))?;
        self.create_partitioners(&schema)?;
        debug!(operator = self.context.name(), generation = self.generation, "Exchange schema set up");

        if self.first {
            self.first = false;
            if let Some(decorator) = self.decorator.as_mut() {
                decorator.send_empty_batch(false)?;
            }
            debug!(receivers = self.destinations.len(), "Fast schema batches sent");
        }
        Ok(())
    }

    /// Last batch to every receiver when upstream never produced a schema
    fn send_empty_last(&self) -> EngineResult<()> {
        let schema = self.incoming.batch().schema().clone();
        for (index, destination) in self.destinations.iter().enumerate() {
            if self.status.is_finished(index) {
                continue;
            }
            destination
                .tunnel
                .send(FragmentWritableBatch::empty(
                    true,
                    self.route,
                    destination.minor_fragment_id,
                    Arc::clone(&schema),
                ))?;
        }
        Ok(())
    }

    fn update_aggregate_stats(&self) {
        let counts = self.receiver_records();
        let stats = self.context.stats();
        if let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) {
            stats.set_long_stat(&ExchangeMetric::MinRecords, *min as i64);
            stats.set_long_stat(&ExchangeMetric::MaxRecords, *max as i64);
        }
    }

    fn finish_early(&mut self) {
        if self.done {
            return;
        }
        info!(
            operator = self.context.name(),
            "All receivers finished, cancelling upstream"
        );
        self.incoming.kill(true);
        self.done = true;
    }
}

impl RootExec for HashExchangeSender {
    fn inner_next(&mut self) -> EngineResult<bool> {
        if self.done {
            return Ok(false);
        }
        if self.status.all_finished() {
            self.finish_early();
            return Ok(false);
        }

        let outcome = self.incoming.next()?;
        match outcome {
            IterOutcome::None => {
                match self.decorator.as_mut() {
                    Some(decorator) => decorator.flush_outgoing(true)?,
                    None => self.send_empty_last()?,
                }
                self.done = true;
                debug!(operator = self.context.name(), "Upstream exhausted, last batches sent");
                Ok(false)
            }
            IterOutcome::Stop => {
                self.done = true;
                Ok(false)
            }
            IterOutcome::OutOfMemory => Err(EngineError::out_of_memory(format!(
                "upstream of '{}' ran out of memory",
                self.context.name()
            ))),
            IterOutcome::NotYet => Ok(true),
            IterOutcome::OkNewSchema => {
                if let Err(e) = self.handle_new_schema() {
                    self.incoming.kill(false);
                    return Err(e);
                }
                self.partition_current()?;
                Ok(true)
            }
            IterOutcome::Ok | IterOutcome::Emit => {
                self.partition_current()?;
                if self.status.all_finished() {
                    self.finish_early();
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    fn receiving_fragment_finished(&self, minor_fragment_id: u32) {
        if self.status.mark_finished(minor_fragment_id) && self.status.all_finished() {
            debug!(operator = self.context.name(), "Every receiver has finished");
        }
    }

    fn close(&mut self) -> EngineResult<()> {
        self.update_aggregate_stats();
        let retired = self.retire_partitioners();
        let stats = self.context.stats();
        info!(
            operator = self.context.name(),
            batches_sent = stats.long_stat(&ExchangeMetric::BatchesSent),
            records_sent = stats.long_stat(&ExchangeMetric::RecordsSent),
            min_records = stats.long_stat(&ExchangeMetric::MinRecords),
            max_records = stats.long_stat(&ExchangeMetric::MaxRecords),
            "Hash exchange closed"
        );
        if let Err(e) = self.incoming.close() {
            warn!(operator = self.context.name(), error = %e, "Upstream close failed");
            return Err(e);
        }
        retired?;
        self.context.close()
    }

    fn name(&self) -> &str {
        self.context.name()
    }
}
