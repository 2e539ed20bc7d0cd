/// Columnar batch with an optional selection vector
///
/// Columns are Arrow arrays shared by reference; handing a batch's columns to
/// the next operator is a pointer copy. When a `SelectionVector2` is attached
/// only the rows it names are visible, in its order.
use crate::error::{EngineError, EngineResult};
use crate::execution::selection::SelectionVector2;
use arrow::array::{new_empty_array, ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::SchemaRef;
use std::sync::Arc;

/// Which indirection, if any, the batch carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionVectorMode {
    #[default]
    None,
    TwoByte,
    /// Produced by multi-batch operators (sort); not supported downstream here
    FourByte,
}

#[derive(Debug)]
pub struct Batch {
    schema: SchemaRef,
    columns: Vec<ArrayRef>,
    row_count: usize,
    mode: SelectionVectorMode,
    sv2: Option<SelectionVector2>,
}

impl Batch {
    /// Build a batch, checking column count, types and lengths against the schema
    pub fn try_new(schema: SchemaRef, columns: Vec<ArrayRef>) -> EngineResult<Self> {
        if columns.len() != schema.fields().len() {
            return Err(EngineError::execution(format!(
                "batch has {} columns but schema declares {}",
                columns.len(),
                schema.fields().len()
            )));
        }
        for (field, column) in schema.fields().iter().zip(&columns) {
            if field.data_type() != column.data_type() {
                return Err(EngineError::execution(format!(
                    "column '{}' is {:?} but schema declares {:?}",
                    field.name(),
                    column.data_type(),
                    field.data_type()
                )));
            }
        }
        let row_count = columns.first().map_or(0, |c| c.len());
        if columns.iter().any(|c| c.len() != row_count) {
            return Err(EngineError::execution("batch columns have different lengths"));
        }
        Ok(Self {
            schema,
            columns,
            row_count,
            mode: SelectionVectorMode::None,
            sv2: None,
        })
    }

    /// Zero-row batch carrying only the schema
    pub fn empty(schema: SchemaRef) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| new_empty_array(f.data_type()))
            .collect();
        Self {
            schema,
            columns,
            row_count: 0,
            mode: SelectionVectorMode::None,
            sv2: None,
        }
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Self {
        Self {
            schema: batch.schema(),
            columns: batch.columns().to_vec(),
            row_count: batch.num_rows(),
            mode: SelectionVectorMode::None,
            sv2: None,
        }
    }

    /// Share `source`'s columns and view them through `sv2`
    pub fn transfer_with_selection(source: &Batch, sv2: SelectionVector2) -> Self {
        Self {
            schema: Arc::clone(&source.schema),
            columns: source.columns.clone(),
            row_count: source.row_count,
            mode: SelectionVectorMode::TwoByte,
            sv2: Some(sv2),
        }
    }

    /// Attach a selection vector after checking every index is in range
    pub fn with_selection_vector(mut self, sv2: SelectionVector2) -> EngineResult<Self> {
        if let Some(bad) = sv2.iter().find(|&row| row >= self.row_count) {
            return Err(EngineError::execution(format!(
                "selection index {} out of range for {} rows",
                bad, self.row_count
            )));
        }
        self.mode = SelectionVectorMode::TwoByte;
        self.sv2 = Some(sv2);
        Ok(self)
    }

    #[cfg(test)]
    pub(crate) fn with_mode(mut self, mode: SelectionVectorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> &[ArrayRef] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> EngineResult<&ArrayRef> {
        self.columns.get(index).ok_or_else(|| {
            EngineError::execution(format!(
                "column index {} out of range ({} columns)",
                index,
                self.columns.len()
            ))
        })
    }

    pub fn index_of(&self, name: &str) -> EngineResult<usize> {
        self.schema
            .index_of(name)
            .map_err(|_| EngineError::execution(format!("column '{}' not found", name)))
    }

    pub fn column_by_name(&self, name: &str) -> EngineResult<&ArrayRef> {
        let index = self.index_of(name)?;
        self.column(index)
    }

    /// Physical rows in the column buffers
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Visible rows: the selection count when one is attached
    pub fn record_count(&self) -> usize {
        match (&self.mode, &self.sv2) {
            (SelectionVectorMode::TwoByte, Some(sv)) => sv.count(),
            _ => self.row_count,
        }
    }

    pub fn selection_mode(&self) -> SelectionVectorMode {
        self.mode
    }

    pub fn selection_vector(&self) -> Option<&SelectionVector2> {
        self.sv2.as_ref()
    }

    pub fn take_selection_vector(&mut self) -> Option<SelectionVector2> {
        self.sv2.take()
    }

    /// Physical row behind visible position `position`
    #[inline]
    pub fn row_at(&self, position: usize) -> usize {
        match &self.sv2 {
            Some(sv) => sv.index(position),
            None => position,
        }
    }

    /// Physical rows in visible order
    pub fn visible_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.record_count()).map(move |p| self.row_at(p))
    }

    /// Materialize visible rows into a dense record batch
    pub fn to_record_batch(&self) -> EngineResult<RecordBatch> {
        let columns = match &self.sv2 {
            Some(sv) => {
                let indices = UInt32Array::from_iter_values(sv.iter().map(|i| i as u32));
                self.columns
                    .iter()
                    .map(|c| take(c.as_ref(), &indices, None))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => self.columns.clone(),
        };
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), columns)?)
    }

    /// Bytes held by the column buffers
    pub fn memory_size(&self) -> usize {
        self.columns.iter().map(|c| c.get_array_memory_size()).sum()
    }
}

/// Field-level schema equality, ignoring metadata
pub fn schemas_equal(a: &SchemaRef, b: &SchemaRef) -> bool {
    Arc::ptr_eq(a, b) || a.fields() == b.fields()
}
