/// Interpreted predicates over Arrow columns
///
/// A `Predicate` tree is checked against the schema at setup and evaluated
/// with Arrow compute kernels once per batch into a boolean mask; `eval(row)`
/// is then a mask lookup. Null results count as "does not pass".
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::Batch;
use crate::execution::context::OperatorContext;
use crate::execution::evaluator::PredicateEvaluator;
use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray,
};
use arrow::compute::kernels::{boolean, cmp};
use arrow::compute::{cast, is_not_null, is_null};
use arrow::datatypes::{DataType, SchemaRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    fn to_array(&self) -> ArrayRef {
        match self {
            ScalarValue::Null => new_null_array(&DataType::Null, 1),
            ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v])),
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str()])),
        }
    }

    /// Type a column is cast to before comparing against this literal
    fn comparison_type(&self, column: &DataType) -> Option<DataType> {
        match (self, column) {
            (ScalarValue::Null, _) => Some(column.clone()),
            (ScalarValue::Boolean(_), DataType::Boolean) => Some(DataType::Boolean),
            (ScalarValue::Int64(_), t) if t.is_integer() => Some(DataType::Int64),
            (ScalarValue::Int64(_), t) if t.is_floating() => Some(DataType::Float64),
            (ScalarValue::Float64(_), t) if t.is_numeric() => Some(DataType::Float64),
            (ScalarValue::Utf8(_), DataType::Utf8 | DataType::LargeUtf8) => Some(DataType::Utf8),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: ScalarValue,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Literal(bool),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: ScalarValue) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    fn validate(&self, schema: &SchemaRef) -> EngineResult<()> {
        match self {
            Predicate::Compare { column, op, value } => {
                let field = schema
                    .field_with_name(column)
                    .map_err(|_| EngineError::setup(format!("column '{}' not found", column)))?;
                if value.comparison_type(field.data_type()).is_none() {
                    return Err(EngineError::setup(format!(
                        "cannot compare column '{}' of type {:?} {} {}",
                        column,
                        field.data_type(),
                        op,
                        value
                    )));
                }
                Ok(())
            }
            Predicate::IsNull(column) | Predicate::IsNotNull(column) => schema
                .index_of(column)
                .map(|_| ())
                .map_err(|_| EngineError::setup(format!("column '{}' not found", column))),
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().try_for_each(|c| c.validate(schema))
            }
            Predicate::Not(child) => child.validate(schema),
            Predicate::Literal(_) => Ok(()),
        }
    }

    fn evaluate(&self, batch: &Batch) -> EngineResult<BooleanArray> {
        let rows = batch.row_count();
        let mask = match self {
            Predicate::Compare { column, op, value } => {
                let array = batch.column_by_name(column)?;
                let target = value
                    .comparison_type(array.data_type())
                    .ok_or_else(|| EngineError::execution(format!("cannot compare '{}'", column)))?;
                let left = cast(array.as_ref(), &target)?;
                let right = cast(value.to_array().as_ref(), &target)?;
                let right = Scalar::new(right);
                match op {
                    CompareOp::Eq => cmp::eq(&left, &right)?,
                    CompareOp::NotEq => cmp::neq(&left, &right)?,
                    CompareOp::Lt => cmp::lt(&left, &right)?,
                    CompareOp::LtEq => cmp::lt_eq(&left, &right)?,
                    CompareOp::Gt => cmp::gt(&left, &right)?,
                    CompareOp::GtEq => cmp::gt_eq(&left, &right)?,
                }
            }
            Predicate::IsNull(column) => is_null(batch.column_by_name(column)?.as_ref())?,
            Predicate::IsNotNull(column) => is_not_null(batch.column_by_name(column)?.as_ref())?,
            Predicate::And(children) => {
                let mut acc = BooleanArray::from(vec![true; rows]);
                for child in children {
                    acc = boolean::and_kleene(&acc, &child.evaluate(batch)?)?;
                }
                acc
            }
            Predicate::Or(children) => {
                let mut acc = BooleanArray::from(vec![false; rows]);
                for child in children {
                    acc = boolean::or_kleene(&acc, &child.evaluate(batch)?)?;
                }
                acc
            }
            Predicate::Not(child) => boolean::not(&child.evaluate(batch)?)?,
            Predicate::Literal(v) => BooleanArray::from(vec![*v; rows]),
        };
        Ok(mask)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => write!(f, "{} {} {}", column, op, value),
            Predicate::IsNull(c) => write!(f, "{} IS NULL", c),
            Predicate::IsNotNull(c) => write!(f, "{} IS NOT NULL", c),
            Predicate::And(children) | Predicate::Or(children) => {
                let sep = if matches!(self, Predicate::And(_)) { " AND " } else { " OR " };
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Predicate::Not(child) => write!(f, "NOT {}", child),
            Predicate::Literal(v) => write!(f, "{}", v),
        }
    }
}

/// `PredicateEvaluator` backed by a `Predicate` tree
#[derive(Debug)]
pub struct ExprPredicate {
    predicate: Predicate,
    mask: Option<BooleanArray>,
}

impl ExprPredicate {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            mask: None,
        }
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl PredicateEvaluator for ExprPredicate {
    fn setup(
        &mut self,
        _context: &OperatorContext,
        incoming: &SchemaRef,
        _outgoing: &SchemaRef,
    ) -> EngineResult<()> {
        self.predicate.validate(incoming)
    }

    fn bind(&mut self, batch: &Batch) -> EngineResult<()> {
        self.mask = Some(self.predicate.evaluate(batch)?);
        Ok(())
    }

    fn eval(&self, row: usize) -> bool {
        self.mask
            .as_ref()
            .is_some_and(|m| m.is_valid(row) && m.value(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{Field, Schema};

    fn batch() -> Batch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        Batch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), Some(5), None, Some(9)])),
                Arc::new(StringArray::from(vec![Some("x"), Some("y"), Some("x"), None])),
            ],
        )
        .unwrap()
    }

    fn mask(p: Predicate) -> Vec<bool> {
        let b = batch();
        p.validate(b.schema()).unwrap();
        let m = p.evaluate(&b).unwrap();
        (0..m.len()).map(|i| m.is_valid(i) && m.value(i)).collect()
    }

    #[test]
    fn test_compare_casts_column() {
        let p = Predicate::compare("a", CompareOp::Gt, ScalarValue::Int64(3));
        assert_eq!(mask(p), vec![false, true, false, true]);
    }

    #[test]
    fn test_boolean_combinators() {
        let p = Predicate::And(vec![
            Predicate::compare("s", CompareOp::Eq, ScalarValue::Utf8("x".into())),
            Predicate::IsNotNull("a".into()),
        ]);
        assert_eq!(mask(p), vec![true, false, false, false]);

        let p = Predicate::Or(vec![
            Predicate::IsNull("a".into()),
            Predicate::compare("a", CompareOp::Eq, ScalarValue::Int64(9)),
        ]);
        assert_eq!(mask(p), vec![false, false, true, true]);

        let p = Predicate::Not(Box::new(Predicate::Literal(false)));
        assert_eq!(mask(p), vec![true; 4]);
    }

    #[test]
    fn test_type_mismatch_rejected_at_setup() {
        let b = batch();
        let p = Predicate::compare("s", CompareOp::Lt, ScalarValue::Int64(1));
        assert!(matches!(p.validate(b.schema()), Err(EngineError::Setup { .. })));
        let p = Predicate::IsNull("missing".into());
        assert!(p.validate(b.schema()).is_err());
    }

    #[test]
    fn test_display() {
        let p = Predicate::compare("a", CompareOp::LtEq, ScalarValue::Float64(2.5));
        assert_eq!(p.to_string(), "a <= 2.5");
    }
}
