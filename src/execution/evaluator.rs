/// Row-level evaluators plugged into operators
///
/// `PredicateEvaluator` answers "does this row pass" and `HashEvaluator`
/// produces a 64-bit hash of a row's key fields. Both are set up once per
/// schema, bound once per batch, then queried per physical row index.
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::Batch;
use crate::execution::context::OperatorContext;
use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, BooleanArray, LargeBinaryArray, LargeStringArray,
    StringArray,
};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, SchemaRef, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use fxhash::FxHasher64;
use std::hash::Hasher;
use std::sync::Arc;

pub trait PredicateEvaluator: Send {
    /// Resolve fields against the incoming schema
    fn setup(
        &mut self,
        context: &OperatorContext,
        incoming: &SchemaRef,
        outgoing: &SchemaRef,
    ) -> EngineResult<()>;

    /// Attach to the columns of a new batch
    fn bind(&mut self, _batch: &Batch) -> EngineResult<()> {
        Ok(())
    }

    /// Whether physical row `row` passes
    fn eval(&self, row: usize) -> bool;
}

pub trait HashEvaluator: Send {
    fn setup(&mut self, context: &OperatorContext, incoming: &SchemaRef) -> EngineResult<()>;

    fn bind(&mut self, batch: &Batch) -> EngineResult<()>;

    /// Hash of the key fields at physical row `row`
    fn hash(&self, row: usize) -> i64;
}

/// Bucket for a hash among `receivers` partitions: `|hash mod receivers|`
#[inline]
pub fn partition_bucket(hash: i64, receivers: usize) -> usize {
    (hash % receivers as i64).unsigned_abs() as usize
}

type RowPredicate = dyn Fn(&[ArrayRef], usize) -> bool + Send + Sync;

/// Predicate over the named columns, given as a closure
pub struct ClosurePredicate {
    fields: Vec<String>,
    predicate: Arc<RowPredicate>,
    columns: Vec<ArrayRef>,
    indices: Option<Vec<usize>>,
}

impl ClosurePredicate {
    pub fn new<F>(fields: Vec<String>, predicate: F) -> Self
    where
        F: Fn(&[ArrayRef], usize) -> bool + Send + Sync + 'static,
    {
        Self {
            fields,
            predicate: Arc::new(predicate),
            columns: Vec::new(),
            indices: None,
        }
    }
}

impl PredicateEvaluator for ClosurePredicate {
    fn setup(
        &mut self,
        _context: &OperatorContext,
        incoming: &SchemaRef,
        _outgoing: &SchemaRef,
    ) -> EngineResult<()> {
        self.indices = Some(resolve_fields(incoming, &self.fields)?);
        Ok(())
    }

    fn bind(&mut self, batch: &Batch) -> EngineResult<()> {
        let Some(indices) = self.indices.as_ref() else {
            return Err(EngineError::setup(format!(
                "predicate over {:?} bound before schema setup",
                self.fields
            )));
        };
        self.columns = indices
            .iter()
            .map(|&i| batch.column(i).cloned())
            .collect::<EngineResult<_>>()?;
        Ok(())
    }

    fn eval(&self, row: usize) -> bool {
        (self.predicate)(&self.columns, row)
    }
}

/// Hash of one or more named fields, deterministic across threads and batches
#[derive(Debug, Clone)]
pub struct FieldHasher {
    fields: Vec<String>,
    indices: Vec<usize>,
    columns: Vec<ArrayRef>,
}

impl FieldHasher {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            indices: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn single(field: impl Into<String>) -> Self {
        Self::new(vec![field.into()])
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Resolve fields and check every one has a hashable type
    pub fn bind_schema(&mut self, incoming: &SchemaRef) -> EngineResult<()> {
        let indices = resolve_fields(incoming, &self.fields)?;
        for &i in &indices {
            let field = incoming.field(i);
            if !is_hashable(field.data_type()) {
                return Err(EngineError::setup(format!(
                    "cannot hash field '{}' of type {:?}",
                    field.name(),
                    field.data_type()
                )));
            }
        }
        self.indices = indices;
        Ok(())
    }

    pub fn bind_columns(&mut self, batch: &Batch) -> EngineResult<()> {
        self.columns = self
            .indices
            .iter()
            .map(|&i| batch.column(i).cloned())
            .collect::<EngineResult<_>>()?;
        Ok(())
    }

    pub fn hash_row(&self, row: usize) -> i64 {
        let mut hasher = FxHasher64::default();
        for column in &self.columns {
            hash_value(column.as_ref(), row, &mut hasher);
        }
        hasher.finish() as i64
    }
}

impl HashEvaluator for FieldHasher {
    fn setup(&mut self, _context: &OperatorContext, incoming: &SchemaRef) -> EngineResult<()> {
        self.bind_schema(incoming)
    }

    fn bind(&mut self, batch: &Batch) -> EngineResult<()> {
        self.bind_columns(batch)
    }

    fn hash(&self, row: usize) -> i64 {
        self.hash_row(row)
    }
}

/// Column indices for `fields`, as a setup error when one is missing
pub fn resolve_fields(schema: &SchemaRef, fields: &[String]) -> EngineResult<Vec<usize>> {
    fields
        .iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| {
                EngineError::setup(format!("field '{}' not found in incoming schema", name))
            })
        })
        .collect()
}

pub fn is_hashable(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::LargeBinary
    )
}

const NULL_MARKER: u64 = 0x9e37_79b9_7f4a_7c15;

/// Feed one cell into `hasher`
///
/// Integers of every width hash as i64 and floats as f64 bits, so keys of
/// different physical widths agree.
pub fn hash_value(array: &dyn Array, row: usize, hasher: &mut impl Hasher) {
    if array.is_null(row) {
        hasher.write_u64(NULL_MARKER);
        return;
    }
    match array.data_type() {
        DataType::Boolean => {
            if let Some(a) = array.as_any().downcast_ref::<BooleanArray>() {
                hasher.write_u8(a.value(row) as u8);
            }
        }
        DataType::Int8 => hasher.write_i64(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => hasher.write_i64(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => hasher.write_i64(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => hasher.write_i64(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => hasher.write_i64(array.as_primitive::<UInt8Type>().value(row) as i64),
        DataType::UInt16 => hasher.write_i64(array.as_primitive::<UInt16Type>().value(row) as i64),
        DataType::UInt32 => hasher.write_i64(array.as_primitive::<UInt32Type>().value(row) as i64),
        DataType::UInt64 => hasher.write_i64(array.as_primitive::<UInt64Type>().value(row) as i64),
        DataType::Float32 => {
            let v = array.as_primitive::<Float32Type>().value(row) as f64;
            hasher.write_u64(normalize_float(v));
        }
        DataType::Float64 => {
            let v = array.as_primitive::<Float64Type>().value(row);
            hasher.write_u64(normalize_float(v));
        }
        DataType::Date32 => hasher.write_i64(array.as_primitive::<Date32Type>().value(row) as i64),
        DataType::Date64 => hasher.write_i64(array.as_primitive::<Date64Type>().value(row)),
        DataType::Timestamp(unit, _) => {
            let v = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
                TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(row),
                TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(row),
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
            };
            hasher.write_i64(v);
        }
        DataType::Utf8 => {
            if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
                hasher.write(a.value(row).as_bytes());
            }
        }
        DataType::LargeUtf8 => {
            if let Some(a) = array.as_any().downcast_ref::<LargeStringArray>() {
                hasher.write(a.value(row).as_bytes());
            }
        }
        DataType::Binary => {
            if let Some(a) = array.as_any().downcast_ref::<BinaryArray>() {
                hasher.write(a.value(row));
            }
        }
        DataType::LargeBinary => {
            if let Some(a) = array.as_any().downcast_ref::<LargeBinaryArray>() {
                hasher.write(a.value(row));
            }
        }
        // rejected by `is_hashable` at setup
        _ => hasher.write_u64(NULL_MARKER),
    }
}

// -0.0 and 0.0 compare equal, and all NaNs hash alike
fn normalize_float(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}
