/// Fragment and operator execution contexts
///
/// A `FragmentContext` is created once per running fragment. It owns the
/// fragment's accountant (a child of the query accountant), the option set,
/// the executor-state sink operators report failures to, and the registry of
/// runtime filters published to this fragment. Each operator gets an
/// `OperatorContext` carrying its own accountant and stats.
use crate::config::RuntimeOptions;
use crate::error::{EngineError, EngineResult};
use crate::execution::stats::OperatorStats;
use crate::memory::{Accountant, MemoryPolicy};
use crate::runtime_filter::RuntimeFilterSink;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Identity of a fragment instance within a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHandle {
    pub query_id: Uuid,
    pub major_fragment_id: u32,
    pub minor_fragment_id: u32,
}

impl FragmentHandle {
    pub fn new(query_id: Uuid, major_fragment_id: u32, minor_fragment_id: u32) -> Self {
        Self {
            query_id,
            major_fragment_id,
            minor_fragment_id,
        }
    }
}

impl fmt::Display for FragmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.query_id, self.major_fragment_id, self.minor_fragment_id
        )
    }
}

/// Sink for failures raised inside a fragment
pub trait ExecutorState: Send + Sync {
    /// Record a failure; the first one wins
    fn fail(&self, error: EngineError);

    /// False once the fragment failed or was cancelled
    fn should_continue(&self) -> bool;
}

/// Default executor state: keeps the first failure and a cancel flag
#[derive(Debug, Default)]
pub struct FragmentExecutorState {
    failure: Mutex<Option<EngineError>>,
    cancelled: AtomicBool,
}

impl FragmentExecutorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<EngineError> {
        self.failure.lock().clone()
    }
}

impl ExecutorState for FragmentExecutorState {
    fn fail(&self, err: EngineError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(error = %err, "Fragment failed");
            *failure = Some(err);
        } else {
            debug!(error = %err, "Additional fragment failure ignored");
        }
    }

    fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.failure.lock().is_none()
    }
}

pub struct FragmentContext {
    handle: FragmentHandle,
    options: Arc<RuntimeOptions>,
    accountant: Arc<Accountant>,
    executor_state: Arc<FragmentExecutorState>,
    runtime_filters: Arc<RuntimeFilterSink>,
}

impl fmt::Debug for FragmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentContext")
            .field("handle", &self.handle)
            .field("accountant", &self.accountant)
            .finish()
    }
}

impl FragmentContext {
    /// Context whose accountant is a child of `query_accountant`
    pub fn new(
        handle: FragmentHandle,
        options: Arc<RuntimeOptions>,
        query_accountant: &Arc<Accountant>,
        runtime_filters: Arc<RuntimeFilterSink>,
    ) -> EngineResult<Arc<Self>> {
        let accountant = query_accountant.new_child(
            format!("fragment:{}:{}", handle.major_fragment_id, handle.minor_fragment_id),
            0,
            options.memory.query_limit_bytes,
        )?;
        info!(fragment = %handle, "Fragment context created");
        Ok(Arc::new(Self {
            handle,
            options,
            accountant,
            executor_state: Arc::new(FragmentExecutorState::new()),
            runtime_filters,
        }))
    }

    /// Standalone context with its own query accountant, sized from `options`
    pub fn standalone(handle: FragmentHandle, options: RuntimeOptions) -> EngineResult<Arc<Self>> {
        options.validate()?;
        let policy = MemoryPolicy::from_options(&options.memory);
        let query = Accountant::new_root(
            format!("query:{}", handle.query_id),
            options.memory.query_limit_bytes,
            policy,
        );
        Self::new(
            handle,
            Arc::new(options),
            &query,
            Arc::new(RuntimeFilterSink::new()),
        )
    }

    pub fn handle(&self) -> FragmentHandle {
        self.handle
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn executor_state(&self) -> &Arc<FragmentExecutorState> {
        &self.executor_state
    }

    pub fn runtime_filters(&self) -> &Arc<RuntimeFilterSink> {
        &self.runtime_filters
    }

    /// Child accountant and fresh stats for a new operator
    pub fn new_operator_context(self: &Arc<Self>, name: impl Into<String>) -> EngineResult<OperatorContext> {
        let name = name.into();
        let memory = &self.options.memory;
        let accountant = self.accountant.new_child(
            format!("op:{}", name),
            memory.operator_initial_reservation,
            memory.operator_max_allocation,
        )?;
        Ok(OperatorContext {
            stats: Arc::new(OperatorStats::new(name.clone())),
            name,
            accountant,
            fragment: Arc::clone(self),
        })
    }

    /// Close the fragment accountant; every operator must be closed first
    pub fn close(&self) -> EngineResult<()> {
        self.accountant.close()
    }
}

/// Per-operator view of the fragment
#[derive(Debug, Clone)]
pub struct OperatorContext {
    name: String,
    accountant: Arc<Accountant>,
    stats: Arc<OperatorStats>,
    fragment: Arc<FragmentContext>,
}

impl OperatorContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn stats(&self) -> &Arc<OperatorStats> {
        &self.stats
    }

    pub fn fragment(&self) -> &Arc<FragmentContext> {
        &self.fragment
    }

    pub fn options(&self) -> &RuntimeOptions {
        self.fragment.options()
    }

    /// Report a failure to the fragment's executor state
    pub fn fail(&self, err: EngineError) {
        self.fragment.executor_state().fail(err);
    }

    pub fn close(&self) -> EngineResult<()> {
        self.accountant.close()
    }
}
