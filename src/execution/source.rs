/// In-memory leaf operator
///
/// Replays a fixed script of outcomes and batches. Used as the scan stand-in
/// for demo plans, benches and protocol tests.
use crate::error::EngineResult;
use crate::execution::batch::{schemas_equal, Batch};
use crate::execution::iter::{BatchOperator, IterOutcome};
use arrow::datatypes::SchemaRef;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One scripted response to `next()`
#[derive(Debug)]
pub enum ScriptStep {
    /// Expose `Batch` and report the outcome
    Batch(IterOutcome, Batch),
    /// Report the outcome without changing the current batch
    Outcome(IterOutcome),
}

#[derive(Debug)]
pub struct ValuesSource {
    name: String,
    steps: VecDeque<ScriptStep>,
    current: Batch,
    killed: Arc<AtomicBool>,
}

impl ValuesSource {
    /// Emit `batches` in order, then NONE. The first batch and every batch
    /// whose schema differs from its predecessor is OK_NEW_SCHEMA.
    pub fn new(schema: SchemaRef, batches: Vec<Batch>) -> Self {
        let mut previous: Option<SchemaRef> = None;
        let steps = batches
            .into_iter()
            .map(|batch| {
                let outcome = match &previous {
                    Some(p) if schemas_equal(p, batch.schema()) => IterOutcome::Ok,
                    _ => IterOutcome::OkNewSchema,
                };
                previous = Some(batch.schema().clone());
                ScriptStep::Batch(outcome, batch)
            })
            .collect();
        Self::scripted(schema, steps)
    }

    /// Exact script; NONE once it runs out
    pub fn scripted(schema: SchemaRef, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "values".to_string(),
            steps: steps.into(),
            current: Batch::empty(schema),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Shared flag set when a kill reaches this source
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl BatchOperator for ValuesSource {
    fn next(&mut self) -> EngineResult<IterOutcome> {
        if self.killed.load(Ordering::SeqCst) {
            return Ok(IterOutcome::None);
        }
        match self.steps.pop_front() {
            Some(ScriptStep::Batch(outcome, batch)) => {
                self.current = batch;
                Ok(outcome)
            }
            Some(ScriptStep::Outcome(outcome)) => Ok(outcome),
            None => Ok(IterOutcome::None),
        }
    }

    fn batch(&self) -> &Batch {
        &self.current
    }

    fn kill(&mut self, _send_upstream: bool) {
        debug!(source = %self.name, remaining = self.steps.len(), "Source killed");
        self.killed.store(true, Ordering::SeqCst);
        self.steps.clear();
    }

    fn close(&mut self) -> EngineResult<()> {
        self.steps.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
