//! Hash exchange end to end over in-process channel tunnels.

use arrow::array::{AsArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use crossbeam::channel::Receiver;
use hypergraph_exec::config::{ExchangeOptions, RuntimeOptions};
use hypergraph_exec::distributed::{
    actual_sender_threads, desired_sender_threads, slice_ranges, ChannelTunnel, Destination,
    ExchangeMetric, FragmentWritableBatch, HashExchangeSender,
};
use hypergraph_exec::execution::{
    partition_bucket, Batch, FieldHasher, FragmentContext, FragmentHandle, FragmentRunner,
    RootExec, ValuesSource,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

fn batch(keys: Vec<i64>) -> Batch {
    let names: StringArray = keys.iter().map(|k| Some(format!("n{}", k))).collect();
    Batch::try_new(schema(), vec![Arc::new(Int64Array::from(keys)), Arc::new(names)]).unwrap()
}

fn fragment(imposed_threads: usize, batch_size: usize) -> Arc<FragmentContext> {
    let mut options = RuntimeOptions::default();
    options.exchange.imposed_sender_threads = imposed_threads;
    options.exchange.outgoing_batch_size = batch_size;
    FragmentContext::standalone(FragmentHandle::new(Uuid::new_v4(), 3, 1), options).unwrap()
}

fn destinations(n: u32) -> (Vec<Destination>, Vec<Receiver<FragmentWritableBatch>>) {
    (0..n)
        .map(|id| {
            let (tunnel, rx) = ChannelTunnel::unbounded();
            (Destination::new(id, Arc::new(tunnel)), rx)
        })
        .unzip()
}

fn expected_receiver(input: &Batch, row: usize, receivers: usize) -> usize {
    let mut hasher = FieldHasher::single("k");
    hasher.bind_schema(input.schema()).unwrap();
    hasher.bind_columns(input).unwrap();
    partition_bucket(hasher.hash_row(row), receivers)
}

#[test]
fn test_sizing_for_small_cost_uses_one_worker() {
    let options = ExchangeOptions {
        slice_target: 1000,
        thread_factor: 2,
        max_sender_threads: 8,
        imposed_sender_threads: 0,
        outgoing_batch_size: 1024,
    };
    let desired = desired_sender_threads(5000.0, 4, &options);
    assert_eq!(desired, 1);
    assert_eq!(actual_sender_threads(desired, 4), 1);
    assert_eq!(slice_ranges(4, 1), vec![0..4]);
}

#[test]
fn test_rows_land_on_their_hash_receiver() {
    const RECEIVERS: u32 = 7;
    let fragment = fragment(3, 16);
    let (dests, inboxes) = destinations(RECEIVERS);
    let inputs = vec![batch((0..100).collect()), batch((-50..150).rev().collect())];

    let mut expected: HashMap<usize, Vec<i64>> = HashMap::new();
    for input in &inputs {
        let keys = input.column(0).unwrap().as_primitive::<Int64Type>();
        for row in input.visible_rows() {
            expected
                .entry(expected_receiver(input, row, RECEIVERS as usize))
                .or_default()
                .push(keys.value(row));
        }
    }

    let source = ValuesSource::new(schema(), inputs);
    let mut sender = HashExchangeSender::new(
        fragment.new_operator_context("hash-exchange").unwrap(),
        Box::new(source),
        Box::new(FieldHasher::single("k")),
        dests,
        4,
        1_000_000.0,
    )
    .unwrap();
    assert_eq!(sender.num_workers(), 3);
    FragmentRunner::new(Arc::clone(&fragment)).run(&mut sender).unwrap();

    let mut total = 0;
    for (index, inbox) in inboxes.iter().enumerate() {
        let envelopes: Vec<_> = inbox.try_iter().collect();
        assert!(envelopes.len() >= 2, "receiver {} missed fast schema or last batch", index);
        assert_eq!(envelopes[0].row_count, 0);
        assert!(envelopes.last().unwrap().is_last_batch);
        for envelope in &envelopes {
            assert_eq!(envelope.receiving_minor_fragment_ids, vec![index as u32]);
            assert_eq!(envelope.route.receiving_major_fragment_id, 4);
            assert_eq!(envelope.route.sending_major_fragment_id, 3);
            assert!(envelope.row_count <= 16);
        }
        let mut got: Vec<i64> = envelopes
            .iter()
            .flat_map(|e| e.columns[0].as_primitive::<Int64Type>().values().to_vec())
            .collect();
        let mut want = expected.remove(&index).unwrap_or_default();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want, "receiver {}", index);
        total += got.len();
    }
    assert_eq!(total, 300);
    let stats = sender.stats();
    assert_eq!(stats.long_stat(&ExchangeMetric::RecordsSent), 300);
    assert_eq!(stats.long_stat(&ExchangeMetric::SendingThreadsCount), 3);
    assert!(stats.long_stat(&ExchangeMetric::MinRecords) <= stats.long_stat(&ExchangeMetric::MaxRecords));
}

#[test]
fn test_terminated_receiver_stops_receiving() {
    let fragment = fragment(1, 4);
    let (dests, inboxes) = destinations(2);
    let source = ValuesSource::new(
        schema(),
        vec![batch((0..20).collect()), batch((20..40).collect()), batch((40..60).collect())],
    );
    let mut sender = HashExchangeSender::new(
        fragment.new_operator_context("hash-exchange").unwrap(),
        Box::new(source),
        Box::new(FieldHasher::single("k")),
        dests,
        2,
        0.0,
    )
    .unwrap();

    assert!(sender.inner_next().unwrap());
    sender.receiving_fragment_finished(0);
    while sender.inner_next().unwrap() {}
    sender.close().unwrap();

    let finished: Vec<_> = inboxes[0].try_iter().collect();
    assert_eq!(finished.iter().filter(|e| e.is_last_batch).count(), 1);
    assert!(finished.last().unwrap().is_last_batch);

    let live: Vec<_> = inboxes[1].try_iter().collect();
    assert!(live.last().unwrap().is_last_batch);
    assert_eq!(live.iter().filter(|e| e.is_last_batch).count(), 1);
}

#[test]
fn test_all_receivers_finished_ends_fragment() {
    let fragment = fragment(0, 1024);
    let (dests, _inboxes) = destinations(3);
    let source = ValuesSource::new(schema(), vec![batch(vec![1]), batch(vec![2]), batch(vec![3])]);
    let killed = source.kill_flag();
    let mut sender = HashExchangeSender::new(
        fragment.new_operator_context("hash-exchange").unwrap(),
        Box::new(source),
        Box::new(FieldHasher::single("k")),
        dests,
        2,
        10.0,
    )
    .unwrap();
    let status = sender.receiver_status();
    for minor in 0..3 {
        status.mark_finished(minor);
    }
    FragmentRunner::new(Arc::clone(&fragment)).run(&mut sender).unwrap();
    assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn test_schema_change_flushes_then_rebuilds_partitioners() {
    let fragment = fragment(1, 1024);
    let (dests, inboxes) = destinations(2);
    let wide_schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));
    let before = batch((0..10).collect());
    let after = Batch::try_new(
        Arc::clone(&wide_schema),
        vec![
            Arc::new(Int64Array::from_iter_values(10..20)),
            Arc::new(Int64Array::from_iter_values(110..120)),
        ],
    )
    .unwrap();

    let mut expected_before: HashMap<usize, Vec<i64>> = HashMap::new();
    let mut expected_after: HashMap<usize, Vec<i64>> = HashMap::new();
    for (input, expected) in [(&before, &mut expected_before), (&after, &mut expected_after)] {
        let keys = input.column(0).unwrap().as_primitive::<Int64Type>();
        for row in input.visible_rows() {
            expected
                .entry(expected_receiver(input, row, 2))
                .or_default()
                .push(keys.value(row));
        }
    }

    let source = ValuesSource::new(schema(), vec![before, after]);
    let mut sender = HashExchangeSender::new(
        fragment.new_operator_context("hash-exchange").unwrap(),
        Box::new(source),
        Box::new(FieldHasher::single("k")),
        dests,
        2,
        100.0,
    )
    .unwrap();
    FragmentRunner::new(Arc::clone(&fragment)).run(&mut sender).unwrap();

    for (index, inbox) in inboxes.iter().enumerate() {
        let envelopes: Vec<_> = inbox.try_iter().collect();
        // one fast-schema batch only, for the first schema
        let fast: Vec<_> = envelopes
            .iter()
            .filter(|e| e.row_count == 0 && !e.is_last_batch)
            .collect();
        assert_eq!(fast.len(), 1, "receiver {}", index);
        assert_eq!(fast[0].schema.fields().len(), 2);
        assert_eq!(fast[0].schema.field(1).name(), "name");

        let keys_with = |field: &str| -> Vec<i64> {
            let mut keys: Vec<i64> = envelopes
                .iter()
                .filter(|e| e.schema.field(1).name() == field)
                .flat_map(|e| e.columns[0].as_primitive::<Int64Type>().values().to_vec())
                .collect();
            keys.sort_unstable();
            keys
        };
        let mut want_before = expected_before.remove(&index).unwrap_or_default();
        let mut want_after = expected_after.remove(&index).unwrap_or_default();
        want_before.sort_unstable();
        want_after.sort_unstable();
        assert_eq!(keys_with("name"), want_before, "receiver {}", index);
        assert_eq!(keys_with("v"), want_after, "receiver {}", index);

        // rows of the old schema are sent before any row of the new one
        let first_new = envelopes
            .iter()
            .position(|e| e.schema.field(1).name() == "v")
            .unwrap();
        assert!(envelopes[first_new..].iter().all(|e| e.schema.field(1).name() == "v"));
        let last = envelopes.last().unwrap();
        assert!(last.is_last_batch);
        assert_eq!(envelopes.iter().filter(|e| e.is_last_batch).count(), 1);
        for envelope in &envelopes {
            assert_eq!(envelope.columns.len(), envelope.schema.fields().len());
        }
    }
    assert_eq!(sender.stats().long_stat(&ExchangeMetric::RecordsSent), 20);
}
