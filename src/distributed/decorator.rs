/// Lifecycle coordinator for the exchange's partitioner workers
///
/// Applies one step (partition, flush, fast-schema send) to every worker. With
/// more than one worker the step runs on a dedicated rayon pool sized to the
/// worker count; the first error any worker reports is returned.
use crate::distributed::partitioner::HashPartitioner;
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::Batch;
use crate::execution::stats::OperatorStats;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

pub struct PartitionerDecorator {
    partitioners: Vec<HashPartitioner>,
    pool: Option<ThreadPool>,
}

impl PartitionerDecorator {
    pub fn new(partitioners: Vec<HashPartitioner>) -> EngineResult<Self> {
        let pool = if partitioners.len() > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(partitioners.len())
                .thread_name(|i| format!("exchange-sender-{}", i))
                .build()
                .map_err(|e| EngineError::setup(format!("cannot start sender workers: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        debug!(workers = partitioners.len(), "Partitioner workers created");
        Ok(Self { partitioners, pool })
    }

    pub fn num_workers(&self) -> usize {
        self.partitioners.len()
    }

    pub fn partitioners(&self) -> &[HashPartitioner] {
        &self.partitioners
    }

    fn execute<F>(&mut self, step: F) -> EngineResult<()>
    where
        F: Fn(&mut HashPartitioner) -> EngineResult<()> + Send + Sync,
    {
        match &self.pool {
            Some(pool) => {
                let partitioners = &mut self.partitioners;
                pool.install(|| partitioners.par_iter_mut().try_for_each(|p| step(p)))
            }
            None => self.partitioners.iter_mut().try_for_each(step),
        }
    }

    pub fn partition_batch(&mut self, incoming: &Batch, buckets: &[u32]) -> EngineResult<()> {
        self.execute(|p| p.partition_batch(incoming, buckets))
    }

    pub fn flush_outgoing(&mut self, is_last: bool) -> EngineResult<()> {
        self.execute(|p| p.flush_outgoing(is_last))
    }

    pub fn send_empty_batch(&mut self, is_last: bool) -> EngineResult<()> {
        self.execute(|p| p.send_empty_batch(is_last))
    }

    /// Rows sent to each receiver, indexed by receiver position
    pub fn outgoing_record_counts(&self, receivers: usize) -> Vec<u64> {
        let mut counts = vec![0u64; receivers];
        for outgoing in self.partitioners.iter().flat_map(|p| p.outgoing()) {
            if let Some(slot) = counts.get_mut(outgoing.receiver_index()) {
                *slot += outgoing.total_records();
            }
        }
        counts
    }

    /// Fold every worker's counters into `stats`
    pub fn merge_stats(&self, stats: &OperatorStats) {
        for partitioner in &self.partitioners {
            stats.merge_metrics(partitioner.stats());
        }
    }

    /// Tear every worker down; all are cleared even if one fails
    pub fn clear(&mut self) -> EngineResult<()> {
        let mut first_error = None;
        for partitioner in &mut self.partitioners {
            if let Err(e) = partitioner.clear() {
                first_error.get_or_insert(e);
            }
        }
        self.partitioners.clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
