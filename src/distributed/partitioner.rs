use crate::distributed::message::ExchangeRoute;
use crate::distributed::outgoing::PartitionOutgoingBatch;
use crate::distributed::receivers::{Destination, ReceiverStatus};
use crate::error::EngineResult;
use crate::execution::batch::Batch;
use crate::execution::stats::OperatorStats;
use crate::memory::Accountant;
use arrow::datatypes::SchemaRef;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Routes rows to a contiguous slice of receivers
///
/// Each worker owns the outgoing buffers for its slice exclusively, so
/// workers running in parallel never touch the same buffer.
pub struct HashPartitioner {
    worker_id: usize,
    receivers: Range<usize>,
    outgoing: Vec<PartitionOutgoingBatch>,
    accountant: Arc<Accountant>,
    stats: OperatorStats,
}

impl HashPartitioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        receivers: Range<usize>,
        destinations: &[Destination],
        status: &Arc<ReceiverStatus>,
        route: ExchangeRoute,
        schema: &SchemaRef,
        batch_size: usize,
        accountant: Arc<Accountant>,
    ) -> Self {
        let outgoing = receivers
            .clone()
            .map(|index| {
                let destination = &destinations[index];
                PartitionOutgoingBatch::new(
                    index,
                    destination.minor_fragment_id,
                    Arc::clone(&destination.tunnel),
                    Arc::clone(status),
                    route,
                    Arc::clone(schema),
                    batch_size,
                    &accountant,
                )
            })
            .collect();
        Self {
            worker_id,
            stats: OperatorStats::new(format!("partitioner-{}", worker_id)),
            receivers,
            outgoing,
            accountant,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn receivers(&self) -> Range<usize> {
        self.receivers.clone()
    }

    pub fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    pub fn outgoing(&self) -> &[PartitionOutgoingBatch] {
        &self.outgoing
    }

    /// Route every visible row whose bucket falls in this worker's slice
    ///
    /// `buckets[p]` is the receiver index of visible position `p`.
    pub fn partition_batch(&mut self, incoming: &Batch, buckets: &[u32]) -> EngineResult<()> {
        let start = self.receivers.start;
        let mut routed = 0usize;
        for (position, row) in incoming.visible_rows().enumerate() {
            let bucket = buckets[position] as usize;
            if self.receivers.contains(&bucket) {
                self.outgoing[bucket - start].route(row, incoming, &self.stats)?;
                routed += 1;
            }
        }
        for outgoing in &mut self.outgoing {
            outgoing.seal(incoming)?;
        }
        self.stats.record_batch(routed);
        Ok(())
    }

    pub fn flush_outgoing(&mut self, is_last: bool) -> EngineResult<()> {
        for outgoing in &mut self.outgoing {
            outgoing.flush(is_last, &self.stats)?;
        }
        Ok(())
    }

    pub fn send_empty_batch(&self, is_last: bool) -> EngineResult<()> {
        for outgoing in &self.outgoing {
            outgoing.send_empty(is_last)?;
        }
        Ok(())
    }

    /// Drop all buffers and close this worker's accountant
    pub fn clear(&mut self) -> EngineResult<()> {
        self.outgoing.clear();
        debug!(
            worker = self.worker_id,
            peak_memory = self.accountant.peak(),
            "Partitioner cleared"
        );
        self.accountant.close()
    }
}
