/// Fragment root and its driver loop
///
/// A fragment's root does not produce batches for a parent; it consumes its
/// child and ships results elsewhere (for example across an exchange). The
/// runner pulls the root until it reports no more work, the fragment fails,
/// or it is cancelled, then closes the root and the fragment accountant.
use crate::error::EngineResult;
use crate::execution::context::{ExecutorState, FragmentContext};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub trait RootExec: Send {
    /// Do one unit of work; `false` once the root has nothing left to do
    fn inner_next(&mut self) -> EngineResult<bool>;

    /// A downstream consumer no longer wants data
    fn receiving_fragment_finished(&self, minor_fragment_id: u32);

    fn close(&mut self) -> EngineResult<()>;

    fn name(&self) -> &str;
}

pub struct FragmentRunner {
    context: Arc<FragmentContext>,
}

impl FragmentRunner {
    pub fn new(context: Arc<FragmentContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<FragmentContext> {
        &self.context
    }

    /// Drive `root` to completion and report the first failure, if any
    pub fn run(&self, root: &mut dyn RootExec) -> EngineResult<()> {
        let handle = self.context.handle();
        let state = self.context.executor_state();
        let start = Instant::now();
        info!(fragment = %handle, root = root.name(), "Fragment starting");

        let mut steps = 0u64;
        while state.should_continue() {
            match root.inner_next() {
                Ok(true) => steps += 1,
                Ok(false) => break,
                Err(err) => {
                    error!(fragment = %handle, error = %err, "Root failed");
                    state.fail(err);
                    break;
                }
            }
        }
        if state.is_cancelled() {
            warn!(fragment = %handle, "Fragment cancelled");
        }

        if let Err(err) = root.close() {
            state.fail(err);
        }
        if let Err(err) = self.context.close() {
            state.fail(err);
        }

        info!(
            fragment = %handle,
            steps = steps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            peak_memory = self.context.accountant().peak(),
            "Fragment finished"
        );
        match state.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
