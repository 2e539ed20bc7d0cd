//! # Hypergraph Exec
//!
//! Vectorized fragment execution runtime.
//!
//! A query runs as fragments; each fragment is a tree of operators that pull
//! columnar batches from their children and report an `IterOutcome` with
//! every call. This crate provides:
//!
//! - **Memory accounting**: a tree of `Accountant`s with limits, grace and peak tracking
//! - **Batch protocol**: `IterOutcome`, `BatchOperator` and the single-input driver
//! - **Selection vectors**: `SelectionVector2` and the `FilterOperator`
//! - **Hash exchange**: `HashExchangeSender` fanning batches out to receivers
//! - **Runtime filters**: bloom filter semi-join pruning on the probe side
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hypergraph_exec::config::RuntimeOptions;
//! use hypergraph_exec::execution::{FragmentContext, FragmentHandle};
//! use uuid::Uuid;
//!
//! let handle = FragmentHandle::new(Uuid::new_v4(), 1, 0);
//! let fragment = FragmentContext::standalone(handle, RuntimeOptions::default()).unwrap();
//! let filter_ctx = fragment.new_operator_context("filter").unwrap();
//! println!("operator memory limit: {}", filter_ctx.accountant().limit());
//! ```

pub mod config;
pub mod distributed;
pub mod error;
pub mod execution;
pub mod memory;
pub mod runtime_filter;

pub use config::RuntimeOptions;
pub use distributed::{ChannelTunnel, Destination, HashExchangeSender};
pub use error::{EngineError, EngineResult};
pub use execution::{
    Batch, BatchOperator, FilterOperator, FragmentContext, FragmentHandle, FragmentRunner,
    IterOutcome, OperatorContext, RootExec, SelectionVector2,
};
pub use memory::{Accountant, MemoryPolicy};
pub use runtime_filter::{RuntimeFilterOperator, RuntimeFilterSink, RuntimeFilterWritable};
