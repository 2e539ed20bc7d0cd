/// Per-receiver accumulation buffer of the hash exchange
///
/// Rows routed to a receiver are remembered as indices into the current
/// incoming batch and copied out (`take`) when that batch is done, since the
/// incoming columns are only valid until upstream's next `next()`. Copied
/// chunks are charged to the partitioner's accountant and concatenated into
/// one envelope on flush.
use crate::distributed::message::{ExchangeRoute, FragmentWritableBatch};
use crate::distributed::receivers::ReceiverStatus;
use crate::distributed::sender::ExchangeMetric;
use crate::distributed::tunnel::DataTunnel;
use crate::error::EngineResult;
use crate::execution::batch::Batch;
use crate::execution::stats::OperatorStats;
use crate::memory::{Accountant, Reservation};
use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::{concat, take};
use arrow::datatypes::SchemaRef;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct PartitionOutgoingBatch {
    receiver_index: usize,
    minor_fragment_id: u32,
    tunnel: Arc<dyn DataTunnel>,
    status: Arc<ReceiverStatus>,
    route: ExchangeRoute,
    schema: SchemaRef,
    batch_size: usize,
    indices: Vec<u32>,
    chunks: Vec<Vec<ArrayRef>>,
    chunk_rows: usize,
    reservation: Reservation,
    drop_all: bool,
    total_records: u64,
}

impl PartitionOutgoingBatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver_index: usize,
        minor_fragment_id: u32,
        tunnel: Arc<dyn DataTunnel>,
        status: Arc<ReceiverStatus>,
        route: ExchangeRoute,
        schema: SchemaRef,
        batch_size: usize,
        accountant: &Arc<Accountant>,
    ) -> Self {
        Self {
            receiver_index,
            minor_fragment_id,
            tunnel,
            status,
            route,
            schema,
            batch_size: batch_size.max(1),
            indices: Vec::new(),
            chunks: Vec::new(),
            chunk_rows: 0,
            reservation: Reservation::empty(accountant),
            drop_all: false,
            total_records: 0,
        }
    }

    pub fn receiver_index(&self) -> usize {
        self.receiver_index
    }

    pub fn minor_fragment_id(&self) -> u32 {
        self.minor_fragment_id
    }

    /// Rows buffered and not yet sent
    pub fn pending_rows(&self) -> usize {
        self.indices.len() + self.chunk_rows
    }

    /// Rows sent to this receiver so far
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn is_dropping(&self) -> bool {
        self.drop_all
    }

    /// Buffer physical row `row` of `incoming`; flushes once the buffer is full
    pub fn route(&mut self, row: usize, incoming: &Batch, stats: &OperatorStats) -> EngineResult<()> {
        if self.drop_all {
            return Ok(());
        }
        self.indices.push(row as u32);
        if self.pending_rows() >= self.batch_size {
            self.seal(incoming)?;
            self.flush(false, stats)?;
        }
        Ok(())
    }

    /// Copy the buffered rows out of `incoming` before it is replaced
    pub fn seal(&mut self, incoming: &Batch) -> EngineResult<()> {
        if self.indices.is_empty() {
            return Ok(());
        }
        let indices = UInt32Array::from(std::mem::take(&mut self.indices));
        let columns = incoming
            .columns()
            .iter()
            .map(|c| take(c.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()?;
        let bytes: usize = columns.iter().map(|c| c.get_array_memory_size()).sum();
        self.reservation.try_grow(bytes as u64)?;
        self.chunk_rows += indices.len();
        self.chunks.push(columns);
        Ok(())
    }

    /// Send the buffered rows. A terminated receiver gets one last batch and
    /// everything routed to it afterwards is dropped.
    pub fn flush(&mut self, is_last: bool, stats: &OperatorStats) -> EngineResult<()> {
        if self.drop_all {
            self.discard();
            return Ok(());
        }
        let terminated = self.status.is_finished(self.receiver_index);
        let last = is_last || terminated;
        if self.chunk_rows == 0 && !last {
            return Ok(());
        }

        let columns = self.assemble()?;
        let envelope = FragmentWritableBatch::new(
            last,
            self.route,
            self.minor_fragment_id,
            Arc::clone(&self.schema),
            columns,
        );
        let rows = envelope.row_count;
        let bytes = envelope.byte_size();
        self.tunnel.send(envelope)?;

        self.total_records += rows as u64;
        stats.add_long_stat(&ExchangeMetric::BatchesSent, 1);
        stats.add_long_stat(&ExchangeMetric::RecordsSent, rows as i64);
        stats.add_long_stat(&ExchangeMetric::BytesSent, bytes as i64);
        trace!(
            receiver = self.minor_fragment_id,
            rows = rows,
            last = last,
            "Flushed outgoing batch"
        );

        self.discard();
        if terminated {
            debug!(receiver = self.minor_fragment_id, "Receiver terminated, dropping its rows");
            self.drop_all = true;
        }
        Ok(())
    }

    /// Schema-only batch so the receiver can set up before data arrives
    pub fn send_empty(&self, is_last: bool) -> EngineResult<()> {
        self.tunnel.send(FragmentWritableBatch::empty(
            is_last,
            self.route,
            self.minor_fragment_id,
            Arc::clone(&self.schema),
        ))
    }

    /// Drop buffered rows and give their memory back
    pub fn discard(&mut self) {
        self.indices.clear();
        self.chunks.clear();
        self.chunk_rows = 0;
        self.reservation.free();
    }

    fn assemble(&mut self) -> EngineResult<Vec<ArrayRef>> {
        let chunks = std::mem::take(&mut self.chunks);
        match chunks.len() {
            0 => Ok(self
                .schema
                .fields()
                .iter()
                .map(|f| arrow::array::new_empty_array(f.data_type()))
                .collect()),
            1 => Ok(chunks.into_iter().flatten().collect()),
            _ => (0..self.schema.fields().len())
                .map(|col| {
                    let parts: Vec<&dyn Array> = chunks.iter().map(|c| c[col].as_ref()).collect();
                    Ok(concat(&parts)?)
                })
                .collect(),
        }
    }
}
