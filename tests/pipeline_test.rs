//! Operator chains driven through the batch protocol: scan -> filter ->
//! runtime filter, checked at the visible-row level.

use arrow::array::{AsArray, Int64Array};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use hypergraph_exec::config::RuntimeOptions;
use hypergraph_exec::execution::{
    Batch, BatchOperator, ClosurePredicate, CompareOp, ExprPredicate, FilterMetric,
    FilterOperator, FragmentContext, FragmentHandle, IterOutcome, Predicate, ScalarValue,
    ScriptStep, ValuesSource,
};
use hypergraph_exec::runtime_filter::{RuntimeFilterBuilder, RuntimeFilterOperator};
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("row_id", DataType::Int64, false),
        Field::new("k", DataType::Int64, false),
    ]))
}

fn batch(rows: std::ops::Range<i64>) -> Batch {
    let ids = Int64Array::from_iter_values(rows.clone());
    let keys = Int64Array::from_iter_values(rows.map(|r| r % 10));
    Batch::try_new(schema(), vec![Arc::new(ids), Arc::new(keys)]).unwrap()
}

fn fragment() -> Arc<FragmentContext> {
    let mut options = RuntimeOptions::default();
    options.runtime_filter.max_wait_ms = 10;
    FragmentContext::standalone(FragmentHandle::new(Uuid::new_v4(), 0, 0), options).unwrap()
}

fn visible_ids(batch: &Batch) -> Vec<i64> {
    let ids = batch.column(0).unwrap().as_primitive::<Int64Type>();
    batch.visible_rows().map(|row| ids.value(row)).collect()
}

fn even_rows() -> ClosurePredicate {
    ClosurePredicate::new(vec!["row_id".to_string()], |cols, row| {
        cols[0].as_primitive::<Int64Type>().value(row) % 2 == 0
    })
}

/// Pull `op` until NONE or STOP, collecting outcomes and visible ids
fn drain(op: &mut dyn BatchOperator) -> (Vec<IterOutcome>, Vec<i64>) {
    let mut outcomes = Vec::new();
    let mut ids = Vec::new();
    loop {
        let outcome = op.next().unwrap();
        outcomes.push(outcome);
        if outcome.has_data() {
            ids.extend(visible_ids(op.batch()));
        }
        if outcome.is_terminal() {
            return (outcomes, ids);
        }
    }
}

#[test]
fn test_filter_selects_even_rows() {
    let fragment = fragment();
    let source = ValuesSource::new(schema(), vec![batch(0..5)]);
    let mut filter = FilterOperator::new(
        fragment.new_operator_context("filter").unwrap(),
        Box::new(source),
        Box::new(even_rows()),
    );

    assert_eq!(filter.next().unwrap(), IterOutcome::OkNewSchema);
    let out = filter.batch();
    let sv = out.selection_vector().unwrap();
    assert_eq!(sv.as_slice(), &[0, 2, 4]);
    assert_eq!(out.record_count(), 3);
    assert_eq!(filter.next().unwrap(), IterOutcome::None);
    assert_eq!(filter.stats().long_stat(&FilterMetric::RowsIn), 5);
    assert_eq!(filter.stats().long_stat(&FilterMetric::RowsOut), 3);
}

#[test]
fn test_new_schema_reported_once_and_empty_batches_skipped() {
    let fragment = fragment();
    let source = ValuesSource::scripted(
        schema(),
        vec![
            ScriptStep::Batch(IterOutcome::OkNewSchema, batch(0..4)),
            ScriptStep::Batch(IterOutcome::Ok, Batch::empty(schema())),
            ScriptStep::Batch(IterOutcome::Ok, batch(4..8)),
            ScriptStep::Outcome(IterOutcome::NotYet),
            ScriptStep::Batch(IterOutcome::Ok, batch(8..10)),
        ],
    );
    let mut filter = FilterOperator::new(
        fragment.new_operator_context("filter").unwrap(),
        Box::new(source),
        Box::new(even_rows()),
    );
    let (outcomes, ids) = drain(&mut filter);
    assert_eq!(
        outcomes,
        vec![
            IterOutcome::OkNewSchema,
            IterOutcome::Ok,
            IterOutcome::NotYet,
            IterOutcome::Ok,
            IterOutcome::None,
        ]
    );
    assert_eq!(ids, vec![0, 2, 4, 6, 8]);
}

#[test]
fn test_emit_boundaries_pass_through_filters() {
    let fragment = fragment();
    let source = ValuesSource::scripted(
        schema(),
        vec![
            ScriptStep::Batch(IterOutcome::OkNewSchema, batch(0..4)),
            ScriptStep::Batch(IterOutcome::Emit, batch(4..8)),
            ScriptStep::Batch(IterOutcome::Ok, batch(8..10)),
            ScriptStep::Batch(IterOutcome::Emit, Batch::empty(schema())),
        ],
    );
    let filter = FilterOperator::new(
        fragment.new_operator_context("filter").unwrap(),
        Box::new(source),
        Box::new(even_rows()),
    );
    let mut rf = RuntimeFilterOperator::new(
        fragment.new_operator_context("runtime-filter").unwrap(),
        Box::new(filter),
        77,
        vec!["k".into()],
    );

    assert_eq!(rf.next().unwrap(), IterOutcome::OkNewSchema);
    assert_eq!(visible_ids(rf.batch()), vec![0, 2]);
    // rows of the EMIT batch come back once, flagged EMIT
    assert_eq!(rf.next().unwrap(), IterOutcome::Emit);
    assert_eq!(visible_ids(rf.batch()), vec![4, 6]);
    // the boundary is consumed; the next batch is plain OK
    assert_eq!(rf.next().unwrap(), IterOutcome::Ok);
    assert_eq!(visible_ids(rf.batch()), vec![8]);
    // an empty EMIT batch is not skipped like an empty OK
    assert_eq!(rf.next().unwrap(), IterOutcome::Emit);
    assert_eq!(rf.batch().record_count(), 0);
    assert_eq!(rf.next().unwrap(), IterOutcome::None);
    rf.close().unwrap();
}

#[test]
fn test_filter_then_runtime_filter() {
    let fragment = fragment();

    let build_schema = Arc::new(Schema::new(vec![Field::new("bk", DataType::Int64, false)]));
    let build = Batch::try_new(build_schema, vec![Arc::new(Int64Array::from(vec![2, 6]))]).unwrap();
    let mut builder =
        RuntimeFilterBuilder::new(9, vec!["bk".into()], vec!["k".into()], 16, 0.0001).unwrap();
    builder.insert_batch(&build).unwrap();
    fragment.runtime_filters().publish(builder.finish().unwrap()).unwrap();

    let source = ValuesSource::new(schema(), vec![batch(0..20), batch(20..40)]);
    let filter = FilterOperator::new(
        fragment.new_operator_context("filter").unwrap(),
        Box::new(source),
        Box::new(ExprPredicate::new(Predicate::compare(
            "row_id",
            CompareOp::Lt,
            ScalarValue::Int64(30),
        ))),
    );
    let mut rf = RuntimeFilterOperator::new(
        fragment.new_operator_context("runtime-filter").unwrap(),
        Box::new(filter),
        9,
        vec!["k".into()],
    );
    let (outcomes, ids) = drain(&mut rf);
    assert_eq!(outcomes.first(), Some(&IterOutcome::OkNewSchema));
    assert_eq!(outcomes.last(), Some(&IterOutcome::None));
    // Keys 2 and 6 must survive; false positives may add more.
    for expected in [2, 6, 12, 16, 22, 26] {
        assert!(ids.contains(&expected), "row {} was dropped", expected);
    }
    assert!(ids.iter().all(|&id| id < 30));
    assert!(rf.applied_times() >= 1);
}

proptest! {
    /// Survivors are exactly the matching rows, in input order.
    #[test]
    fn filter_keeps_matching_rows_in_order(
        keys in prop::collection::vec(-100i64..100, 0..2000),
        threshold in -100i64..100,
    ) {
        let ids = Int64Array::from_iter_values(0..keys.len() as i64);
        let input = Batch::try_new(
            schema(),
            vec![Arc::new(ids), Arc::new(Int64Array::from(keys.clone()))],
        )
        .unwrap();
        let fragment = fragment();
        let mut filter = FilterOperator::new(
            fragment.new_operator_context("filter").unwrap(),
            Box::new(ValuesSource::new(schema(), vec![input])),
            Box::new(ExprPredicate::new(Predicate::compare(
                "k",
                CompareOp::GtEq,
                ScalarValue::Int64(threshold),
            ))),
        );
        let (_, ids) = drain(&mut filter);
        let expected: Vec<i64> = keys
            .iter()
            .enumerate()
            .filter(|(_, &k)| k >= threshold)
            .map(|(i, _)| i as i64)
            .collect();
        prop_assert_eq!(ids, expected);
    }
}
