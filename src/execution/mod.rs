/// Vectorized execution core: batches, the pull protocol, contexts and
/// the operators that run inside a fragment
pub mod batch;
pub mod context;
pub mod evaluator;
pub mod expr;
pub mod fragment;
pub mod iter;
pub mod operators;
pub mod selection;
pub mod source;
pub mod stats;

pub use batch::{schemas_equal, Batch, SelectionVectorMode};
pub use context::{ExecutorState, FragmentContext, FragmentExecutorState, FragmentHandle, OperatorContext};
pub use evaluator::{partition_bucket, ClosurePredicate, FieldHasher, HashEvaluator, PredicateEvaluator};
pub use expr::{CompareOp, ExprPredicate, Predicate, ScalarValue};
pub use fragment::{FragmentRunner, RootExec};
pub use iter::{drive_next, BatchOperator, IterOutcome, ProtocolState, SingleInputOperator};
pub use operators::{FilterMetric, FilterOperator};
pub use selection::{SelectionVector2, MAX_SV2_CAPACITY};
pub use source::{ScriptStep, ValuesSource};
pub use stats::{MetricDef, OperatorStats};
