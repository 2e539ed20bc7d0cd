//! Fragment runtime demo CLI

use anyhow::{Context, Result};
use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use clap::{Parser, Subcommand};
use hypergraph_exec::config::RuntimeOptions;
use hypergraph_exec::distributed::{ChannelTunnel, Destination, ExchangeMetric, HashExchangeSender};
use hypergraph_exec::execution::{
    Batch, CompareOp, ExprPredicate, FieldHasher, FilterMetric, FilterOperator, FragmentContext,
    FragmentHandle, FragmentRunner, Predicate, ScalarValue, ValuesSource,
};
use hypergraph_exec::runtime_filter::{RuntimeFilterBuilder, RuntimeFilterOperator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hypergraph-exec")]
#[command(about = "Vectorized fragment execution runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scan -> filter -> runtime filter -> hash exchange over generated rows
    Run {
        /// Rows to generate
        #[arg(short, long, default_value = "100000")]
        rows: usize,

        /// Rows per generated batch (at most 65536)
        #[arg(short, long, default_value = "4096")]
        batch_size: usize,

        /// Receiving minor fragments
        #[arg(long, default_value = "4")]
        receivers: u32,

        /// Keep rows with `v >= threshold`
        #[arg(short, long, default_value = "10")]
        threshold: i64,

        /// Distinct build-side keys published as the runtime filter
        #[arg(long, default_value = "5000")]
        build_keys: i64,

        /// JSON file with runtime options
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default runtime options as JSON
    Options,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            rows,
            batch_size,
            receivers,
            threshold,
            build_keys,
            config,
        } => {
            let options = match config {
                Some(path) => RuntimeOptions::from_file(&path)
                    .with_context(|| format!("loading options from {}", path.display()))?,
                None => RuntimeOptions::default(),
            };
            run(options, rows, batch_size, receivers, threshold, build_keys)
        }
        Commands::Options => {
            println!("{}", serde_json::to_string_pretty(&RuntimeOptions::default())?);
            Ok(())
        }
    }
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

/// `k` cycles over twice the build key range, `v` over 0..100
fn generate(schema: &SchemaRef, rows: usize, batch_size: usize, key_range: i64) -> Result<Vec<Batch>> {
    let batch_size = batch_size.clamp(1, 65_536);
    let mut batches = Vec::with_capacity(rows.div_ceil(batch_size));
    let mut start = 0usize;
    while start < rows {
        let end = (start + batch_size).min(rows);
        let keys =
            Int64Array::from_iter_values((start..end).map(|i| (i as i64 * 7) % (key_range * 2)));
        let values = Int64Array::from_iter_values((start..end).map(|i| (i as i64 * 31) % 100));
        batches.push(Batch::try_new(
            Arc::clone(schema),
            vec![Arc::new(keys), Arc::new(values)],
        )?);
        start = end;
    }
    Ok(batches)
}

fn run(
    options: RuntimeOptions,
    rows: usize,
    batch_size: usize,
    receivers: u32,
    threshold: i64,
    build_keys: i64,
) -> Result<()> {
    let schema = schema();
    let key_range = build_keys.max(1);
    let handle = FragmentHandle::new(Uuid::new_v4(), 1, 0);
    let fragment = FragmentContext::standalone(handle, options)?;

    // Build side: every even key below `key_range` joins
    let build_schema = Arc::new(Schema::new(vec![Field::new("bk", DataType::Int64, false)]));
    let build_rows = Int64Array::from_iter_values((0..key_range).map(|k| k * 2));
    let build = Batch::try_new(build_schema, vec![Arc::new(build_rows)])?;
    let mut builder = RuntimeFilterBuilder::new(
        1,
        vec!["bk".to_string()],
        vec!["k".to_string()],
        key_range as usize,
        0.01,
    )?;
    builder.insert_batch(&build)?;
    fragment.runtime_filters().publish(builder.finish()?)?;

    let scan = ValuesSource::new(Arc::clone(&schema), generate(&schema, rows, batch_size, key_range)?)
        .with_name("scan");
    let filter = FilterOperator::new(
        fragment.new_operator_context("filter")?,
        Box::new(scan),
        Box::new(ExprPredicate::new(Predicate::compare(
            "v",
            CompareOp::GtEq,
            ScalarValue::Int64(threshold),
        ))),
    );
    let filter_stats = Arc::clone(filter.stats());
    let runtime_filter = RuntimeFilterOperator::new(
        fragment.new_operator_context("runtime-filter")?,
        Box::new(filter),
        1,
        vec!["k".to_string()],
    );

    let mut inboxes = Vec::with_capacity(receivers as usize);
    let mut destinations = Vec::with_capacity(receivers as usize);
    for minor in 0..receivers {
        let (tunnel, inbox) = ChannelTunnel::unbounded();
        destinations.push(Destination::new(minor, Arc::new(tunnel)));
        inboxes.push(inbox);
    }
    let mut sender = HashExchangeSender::new(
        fragment.new_operator_context("hash-exchange")?,
        Box::new(runtime_filter),
        Box::new(FieldHasher::single("k")),
        destinations,
        2,
        rows as f64,
    )?;

    let start = Instant::now();
    FragmentRunner::new(Arc::clone(&fragment)).run(&mut sender)?;
    let elapsed = start.elapsed();

    println!("Fragment {} finished in {:.2?}", fragment.handle(), elapsed);
    println!(
        "  filter: {} rows in, {} rows out",
        filter_stats.long_stat(&FilterMetric::RowsIn),
        filter_stats.long_stat(&FilterMetric::RowsOut)
    );
    let stats = sender.stats();
    println!(
        "  exchange: {} sender threads, {} batches, {} records, {} bytes",
        stats.long_stat(&ExchangeMetric::SendingThreadsCount),
        stats.long_stat(&ExchangeMetric::BatchesSent),
        stats.long_stat(&ExchangeMetric::RecordsSent),
        stats.long_stat(&ExchangeMetric::BytesSent)
    );
    for (minor, inbox) in inboxes.iter().enumerate() {
        let (batches, records) = inbox
            .try_iter()
            .fold((0usize, 0usize), |(b, r), batch| (b + 1, r + batch.row_count));
        println!("  receiver {}: {} batches, {} records", minor, batches, records);
    }
    println!("  peak fragment memory: {} bytes", fragment.accountant().peak());
    Ok(())
}
