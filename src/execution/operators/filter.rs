/// Filter operator
///
/// Evaluates a predicate per visible input row and exposes the survivors
/// through a two-byte selection vector. Column buffers are handed through
/// untouched; only the 16-bit index list is written.
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::{Batch, SelectionVectorMode};
use crate::execution::context::OperatorContext;
use crate::execution::evaluator::PredicateEvaluator;
use crate::execution::iter::{drive_next, BatchOperator, IterOutcome, ProtocolState, SingleInputOperator};
use crate::execution::selection::{SelectionVector2, MAX_SV2_CAPACITY};
use crate::execution::stats::{MetricDef, OperatorStats};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub enum FilterMetric {
    RowsIn,
    RowsOut,
}

impl MetricDef for FilterMetric {
    fn metric_name(&self) -> &'static str {
        match self {
            FilterMetric::RowsIn => "ROWS_IN",
            FilterMetric::RowsOut => "ROWS_OUT",
        }
    }
}

pub struct FilterOperator {
    context: OperatorContext,
    incoming: Box<dyn BatchOperator>,
    predicate: Box<dyn PredicateEvaluator>,
    outgoing: Batch,
    protocol: ProtocolState,
}

impl FilterOperator {
    pub fn new(
        context: OperatorContext,
        incoming: Box<dyn BatchOperator>,
        predicate: Box<dyn PredicateEvaluator>,
    ) -> Self {
        let outgoing = Batch::empty(incoming.batch().schema().clone());
        Self {
            context,
            incoming,
            predicate,
            outgoing,
            protocol: ProtocolState::new(),
        }
    }

    pub fn stats(&self) -> &Arc<OperatorStats> {
        self.context.stats()
    }

    /// Write surviving row indices into `sv`, returning how many survived
    fn select_rows(&mut self, sv: &mut SelectionVector2) -> EngineResult<usize> {
        let incoming = self.incoming.batch();
        let record_count = incoming.record_count();
        if record_count == 0 {
            return Ok(0);
        }
        if incoming.selection_vector().is_none() && incoming.row_count() > MAX_SV2_CAPACITY {
            return Err(EngineError::execution_with_operator(
                format!(
                    "batch of {} rows cannot be addressed by a two-byte selection vector",
                    incoming.row_count()
                ),
                self.context.name(),
            ));
        }

        sv.ensure_capacity(self.context.accountant(), record_count)?;
        self.predicate.bind(incoming)?;
        let slots = sv.slots_mut()?;
        let mut survivors = 0;
        match incoming.selection_vector() {
            Some(input) => {
                for row in input.iter() {
                    if self.predicate.eval(row) {
                        slots[survivors] = row as u16;
                        survivors += 1;
                    }
                }
            }
            None => {
                for row in 0..record_count {
                    if self.predicate.eval(row) {
                        slots[survivors] = row as u16;
                        survivors += 1;
                    }
                }
            }
        }
        Ok(survivors)
    }
}

impl BatchOperator for FilterOperator {
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
        debug!(
            operator = self.context.name(),
            rows_in = self.context.stats().long_stat(&FilterMetric::RowsIn),
            rows_out = self.context.stats().long_stat(&FilterMetric::RowsOut),
            "Filter closed"
        );
        self.context.close()
    }

    fn name(&self) -> &str {
        self.context.name()
    }
}

impl SingleInputOperator for FilterOperator {
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
                "filter does not accept four-byte selection vectors",
                self.context.name(),
            ));
        }
        let schema = incoming.schema().clone();
        self.predicate
            .setup(&self.context, &schema, &schema)
            .map_err(|e| match e {
                EngineError::Setup { .. } | EngineError::SchemaChange { .. } => {
                    e.with_context(format!("filter '{}'", self.context.name()))
                }
                other => EngineError::setup(other.to_string())
                    .with_context(format!("filter '{}'", self.context.name())),
            })?;
        if let Some(mut sv) = self.outgoing.take_selection_vector() {
            sv.clear();
        }
        self.outgoing = Batch::empty(schema);
        debug!(operator = self.context.name(), "Filter schema set up");
        Ok(true)
    }

    fn do_work(&mut self) -> EngineResult<IterOutcome> {
        if self.incoming.batch().selection_mode() == SelectionVectorMode::FourByte {
            return Err(EngineError::schema_change_in(
                "filter does not accept four-byte selection vectors",
                self.context.name(),
            ));
        }
        let mut sv = self.outgoing.take_selection_vector().unwrap_or_default();
        let survivors = match self.select_rows(&mut sv) {
            Ok(n) => n,
            Err(e) if e.is_out_of_memory() => {
                debug!(operator = self.context.name(), error = %e, "Selection vector allocation refused");
                return Ok(IterOutcome::OutOfMemory);
            }
            Err(e) => return Err(e),
        };
        if sv.is_allocated() {
            sv.set_record_count(survivors)?;
        }
        let incoming = self.incoming.batch();
        sv.set_batch_actual_record_count(incoming.row_count());

        let stats = self.context.stats();
        stats.add_long_stat(&FilterMetric::RowsIn, incoming.record_count() as i64);
        stats.add_long_stat(&FilterMetric::RowsOut, survivors as i64);
        stats.record_batch(survivors);
        trace!(
            operator = self.context.name(),
            rows_in = incoming.record_count(),
            rows_out = survivors,
            "Filtered batch"
        );

        self.outgoing = Batch::transfer_with_selection(incoming, sv);
        Ok(self.protocol.final_outcome(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::execution::context::{FragmentContext, FragmentHandle};
    use crate::execution::evaluator::ClosurePredicate;
    use crate::execution::source::{ScriptStep, ValuesSource};
    use arrow::array::{Array, ArrayRef, AsArray, Int64Array};
    use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
    use std::sync::Arc;
    use uuid::Uuid;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn batch(vals: Vec<i64>) -> Batch {
        Batch::try_new(schema(), vec![Arc::new(Int64Array::from(vals)) as ArrayRef]).unwrap()
    }

    fn even() -> Box<dyn PredicateEvaluator> {
        Box::new(ClosurePredicate::new(vec!["v".into()], |cols, row| {
            cols[0].as_primitive::<Int64Type>().value(row) % 2 == 0
        }))
    }

    fn operator_context() -> OperatorContext {
        let fragment = FragmentContext::standalone(
            FragmentHandle::new(Uuid::new_v4(), 0, 0),
            RuntimeOptions::default(),
        )
        .unwrap();
        fragment.new_operator_context("filter").unwrap()
    }

    #[test]
    fn test_even_rows_selected() {
        let source = ValuesSource::new(schema(), vec![batch(vec![1, 2, 3, 4, 5, 6])]);
        let mut filter = FilterOperator::new(operator_context(), Box::new(source), even());

        assert_eq!(filter.next().unwrap(), IterOutcome::OkNewSchema);
        let out = filter.batch();
        assert_eq!(out.selection_mode(), SelectionVectorMode::TwoByte);
        assert_eq!(out.record_count(), 3);
        assert_eq!(out.visible_rows().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(filter.next().unwrap(), IterOutcome::None);
        filter.close().unwrap();
    }

    #[test]
    fn test_empty_input_batch() {
        let source = ValuesSource::new(schema(), vec![batch(vec![])]);
        let mut filter = FilterOperator::new(operator_context(), Box::new(source), even());
        assert_eq!(filter.next().unwrap(), IterOutcome::OkNewSchema);
        assert_eq!(filter.batch().record_count(), 0);
    }

    #[test]
    fn test_four_byte_input_stops() {
        let steps = vec![ScriptStep::Batch(
            IterOutcome::OkNewSchema,
            batch(vec![1, 2]).with_mode(SelectionVectorMode::FourByte),
        )];
        let source = ValuesSource::scripted(schema(), steps);
        let ctx = operator_context();
        let fragment = ctx.fragment().clone();
        let mut filter = FilterOperator::new(ctx, Box::new(source), even());
        assert_eq!(filter.next().unwrap(), IterOutcome::Stop);
        let failure = fragment.executor_state().failure().unwrap();
        assert!(matches!(failure, EngineError::SchemaChange { .. }));
    }

    #[test]
    fn test_four_byte_batch_after_setup_rejected() {
        let steps = vec![
            ScriptStep::Batch(IterOutcome::OkNewSchema, batch(vec![1, 2])),
            ScriptStep::Batch(
                IterOutcome::Ok,
                batch(vec![3, 4]).with_mode(SelectionVectorMode::FourByte),
            ),
        ];
        let source = ValuesSource::scripted(schema(), steps);
        let mut filter = FilterOperator::new(operator_context(), Box::new(source), even());
        assert_eq!(filter.next().unwrap(), IterOutcome::OkNewSchema);
        let err = filter.next().unwrap_err();
        assert!(matches!(err, EngineError::SchemaChange { .. }));
    }

    #[test]
    fn test_emit_before_any_schema_is_setup_error() {
        let steps = vec![ScriptStep::Batch(IterOutcome::Emit, batch(vec![1, 2]))];
        let source = ValuesSource::scripted(schema(), steps);
        let mut filter = FilterOperator::new(operator_context(), Box::new(source), even());
        let err = filter.next().unwrap_err();
        assert!(matches!(err, EngineError::Setup { .. }));
    }

    #[test]
    fn test_setup_failure_keeps_operator_context() {
        let missing = Box::new(ClosurePredicate::new(vec!["nope".into()], |_, _| true));
        let source = ValuesSource::new(schema(), vec![batch(vec![1])]);
        let ctx = operator_context();
        let fragment = ctx.fragment().clone();
        let mut filter = FilterOperator::new(ctx, Box::new(source), missing);
        assert_eq!(filter.next().unwrap(), IterOutcome::Stop);
        let failure = fragment.executor_state().failure().unwrap();
        assert_eq!(failure.context(), Some("filter 'filter'"));
    }

    #[test]
    fn test_input_selection_is_honored() {
        let ctx = operator_context();
        let mut sv = SelectionVector2::new();
        sv.allocate_new(ctx.accountant(), 3).unwrap();
        {
            let slots = sv.slots_mut().unwrap();
            slots[0] = 3;
            slots[1] = 0;
            slots[2] = 1;
        }
        sv.set_record_count(3).unwrap();
        let input = batch(vec![10, 11, 12, 13]).with_selection_vector(sv).unwrap();
        let source = ValuesSource::new(schema(), vec![input]);
        let mut filter = FilterOperator::new(ctx, Box::new(source), even());
        filter.next().unwrap();
        assert_eq!(filter.batch().visible_rows().collect::<Vec<_>>(), vec![0]);
        let dense = filter.batch().to_record_batch().unwrap();
        assert_eq!(dense.column(0).len(), 1);
    }
}
