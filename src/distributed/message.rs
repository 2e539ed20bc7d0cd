/// Cross-fragment batch envelope
///
/// What a sender hands to the transport: routing identity, the last-batch
/// flag and the column buffers. Transport itself lives behind `DataTunnel`.
use crate::error::EngineResult;
use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::SchemaRef;
use std::sync::Arc;
use uuid::Uuid;

/// Who is sending, and to which major fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRoute {
    pub query_id: Uuid,
    pub sending_major_fragment_id: u32,
    pub sending_minor_fragment_id: u32,
    pub receiving_major_fragment_id: u32,
}

#[derive(Debug, Clone)]
pub struct FragmentWritableBatch {
    pub is_last_batch: bool,
    pub route: ExchangeRoute,
    pub receiving_minor_fragment_ids: Vec<u32>,
    pub schema: SchemaRef,
    pub row_count: usize,
    pub columns: Vec<ArrayRef>,
}

impl FragmentWritableBatch {
    pub fn new(
        is_last_batch: bool,
        route: ExchangeRoute,
        receiving_minor_fragment_id: u32,
        schema: SchemaRef,
        columns: Vec<ArrayRef>,
    ) -> Self {
        let row_count = columns.first().map_or(0, |c| c.len());
        Self {
            is_last_batch,
            route,
            receiving_minor_fragment_ids: vec![receiving_minor_fragment_id],
            schema,
            row_count,
            columns,
        }
    }

    /// Schema-only batch with no rows
    pub fn empty(
        is_last_batch: bool,
        route: ExchangeRoute,
        receiving_minor_fragment_id: u32,
        schema: SchemaRef,
    ) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| arrow::array::new_empty_array(f.data_type()))
            .collect();
        Self::new(is_last_batch, route, receiving_minor_fragment_id, schema, columns)
    }

    pub fn byte_size(&self) -> usize {
        self.columns.iter().map(|c| c.get_array_memory_size()).sum()
    }

    pub fn to_record_batch(&self) -> EngineResult<RecordBatch> {
        Ok(RecordBatch::try_new(
            Arc::clone(&self.schema),
            self.columns.clone(),
        )?)
    }
}
