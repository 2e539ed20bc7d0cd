/// Batch execution protocol
///
/// Operators form a pull tree: a parent calls `next()` on its child, inspects
/// the returned `IterOutcome` and, when the outcome carries data, reads the
/// child's current batch through `batch()`. The batch stays valid until the
/// next call to `next()`.
///
/// `drive_next` implements the shared bookkeeping for single-input operators:
/// first-batch schema handling, skipping empty batches, schema-change
/// detection and EMIT boundaries. Operators only supply schema setup and the
/// per-batch work.
use crate::error::{EngineError, EngineResult};
use crate::execution::batch::{schemas_equal, Batch};
use crate::execution::context::OperatorContext;
use arrow::datatypes::SchemaRef;
use std::fmt;
use tracing::{debug, trace};

/// Outcome of one `next()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterOutcome {
    /// Nothing available now; call again later
    NotYet,
    /// A batch with the same schema as before
    Ok,
    /// A batch with a new schema; downstream must rebuild
    OkNewSchema,
    /// Upstream is exhausted; no batch
    None,
    /// Execution stopped (failure or kill); no batch
    Stop,
    /// Memory could not be obtained
    OutOfMemory,
    /// End of a logical sub-stream; the batch may hold rows
    Emit,
}

impl IterOutcome {
    /// Outcomes after which `batch()` may be read
    pub fn has_data(self) -> bool {
        matches!(self, IterOutcome::Ok | IterOutcome::OkNewSchema | IterOutcome::Emit)
    }

    /// Outcomes after which no further batches will follow
    pub fn is_terminal(self) -> bool {
        matches!(self, IterOutcome::None | IterOutcome::Stop)
    }
}

impl fmt::Display for IterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IterOutcome::NotYet => "NOT_YET",
            IterOutcome::Ok => "OK",
            IterOutcome::OkNewSchema => "OK_NEW_SCHEMA",
            IterOutcome::None => "NONE",
            IterOutcome::Stop => "STOP",
            IterOutcome::OutOfMemory => "OUT_OF_MEMORY",
            IterOutcome::Emit => "EMIT",
        };
        f.write_str(s)
    }
}

/// A node in the operator tree
pub trait BatchOperator: Send {
    fn next(&mut self) -> EngineResult<IterOutcome>;

    /// Current output batch; valid until the next `next()`
    fn batch(&self) -> &Batch;

    /// Abort. With `send_upstream` the kill travels to the children.
    fn kill(&mut self, send_upstream: bool);

    fn close(&mut self) -> EngineResult<()>;

    fn name(&self) -> &str;
}

impl BatchOperator for Box<dyn BatchOperator> {
    fn next(&mut self) -> EngineResult<IterOutcome> {
        (**self).next()
    }

    fn batch(&self) -> &Batch {
        (**self).batch()
    }

    fn kill(&mut self, send_upstream: bool) {
        (**self).kill(send_upstream)
    }

    fn close(&mut self) -> EngineResult<()> {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Where an operator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    First,
    NotFirst,
    Done,
}

/// Protocol bookkeeping kept by every single-input operator
#[derive(Debug, Clone)]
pub struct ProtocolState {
    phase: Phase,
    last_outcome: Option<IterOutcome>,
    incoming_schema: Option<SchemaRef>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    pub fn new() -> Self {
        Self {
            phase: Phase::First,
            last_outcome: None,
            incoming_schema: None,
        }
    }

    pub fn is_first(&self) -> bool {
        self.phase == Phase::First
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn mark_done(&mut self) {
        self.phase = Phase::Done;
    }

    /// Last upstream outcome, after first-batch and schema normalization
    pub fn last_outcome(&self) -> Option<IterOutcome> {
        self.last_outcome
    }

    pub fn set_last_outcome(&mut self, outcome: IterOutcome) {
        self.last_outcome = Some(outcome);
    }

    pub fn incoming_schema(&self) -> Option<&SchemaRef> {
        self.incoming_schema.as_ref()
    }

    /// Outcome for an output batch just produced
    ///
    /// A new schema is reported once, on the first output after it arrived.
    /// EMIT is reported on the output that drains the EMIT batch; while rows
    /// of that batch remain (`has_more_in_boundary`) outputs are plain OK.
    pub fn final_outcome(&mut self, has_more_in_boundary: bool) -> IterOutcome {
        match self.last_outcome {
            Some(IterOutcome::OkNewSchema) => {
                self.last_outcome = Some(IterOutcome::Ok);
                IterOutcome::OkNewSchema
            }
            Some(IterOutcome::Emit) if !has_more_in_boundary => {
                self.last_outcome = Some(IterOutcome::Ok);
                IterOutcome::Emit
            }
            _ => IterOutcome::Ok,
        }
    }
}

/// Hooks a single-input operator supplies to `drive_next`
pub trait SingleInputOperator: BatchOperator {
    fn protocol(&self) -> &ProtocolState;

    fn protocol_mut(&mut self) -> &mut ProtocolState;

    fn incoming(&self) -> &dyn BatchOperator;

    fn incoming_mut(&mut self) -> &mut dyn BatchOperator;

    fn context(&self) -> &OperatorContext;

    /// Rebuild for the incoming batch's schema. Returns whether the output
    /// schema changed.
    fn setup_new_schema(&mut self) -> EngineResult<bool>;

    /// Process the current incoming batch and return the outcome to report
    fn do_work(&mut self) -> EngineResult<IterOutcome>;

    /// Output still buffered from a previous incoming batch
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Produce the next buffered output
    fn drain_pending(&mut self) -> EngineResult<IterOutcome> {
        Ok(self.protocol_mut().final_outcome(false))
    }

    /// Upstream ended without ever producing a batch
    fn handle_null_input(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// One protocol step for a single-input operator
pub fn drive_next<T>(op: &mut T) -> EngineResult<IterOutcome>
where
    T: SingleInputOperator + ?Sized,
{
    if op.protocol().is_done() {
        return Ok(IterOutcome::None);
    }
    if op.has_pending_output() {
        return op.drain_pending();
    }

    let mut upstream = op.incoming_mut().next()?;
    if !op.protocol().is_first() {
        while upstream == IterOutcome::Ok && op.incoming().batch().record_count() == 0 {
            trace!(operator = op.name(), "Skipping empty batch");
            upstream = op.incoming_mut().next()?;
        }
    }
    if op.protocol().is_first() && upstream == IterOutcome::Ok {
        upstream = IterOutcome::OkNewSchema;
    }
    op.protocol_mut().set_last_outcome(upstream);

    match upstream {
        IterOutcome::None => {
            if op.protocol().is_first() {
                op.handle_null_input()?;
            }
            op.protocol_mut().mark_done();
            Ok(IterOutcome::None)
        }
        IterOutcome::NotYet | IterOutcome::Stop | IterOutcome::OutOfMemory => Ok(upstream),
        IterOutcome::OkNewSchema => {
            let first = op.protocol().is_first();
            op.protocol_mut().phase = Phase::NotFirst;
            let schema = op.incoming().batch().schema().clone();
            let unchanged = !first
                && op
                    .protocol()
                    .incoming_schema()
                    .is_some_and(|known| schemas_equal(known, &schema));
            if unchanged {
                op.protocol_mut().set_last_outcome(IterOutcome::Ok);
            } else {
                op.protocol_mut().incoming_schema = Some(schema);
                match op.setup_new_schema() {
                    Ok(true) => {}
                    Ok(false) => op.protocol_mut().set_last_outcome(IterOutcome::Ok),
                    Err(err) if is_setup_failure(&err) => {
                        debug!(operator = op.name(), error = %err, "Schema setup failed");
                        op.kill(false);
                        op.context().fail(err);
                        return Ok(IterOutcome::Stop);
                    }
                    Err(err) => return Err(err),
                }
            }
            op.do_work()
        }
        IterOutcome::Ok | IterOutcome::Emit => op.do_work(),
    }
}

fn is_setup_failure(err: &EngineError) -> bool {
    matches!(err, EngineError::SchemaChange { .. } | EngineError::Setup { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_schema_reported_once() {
        let mut state = ProtocolState::new();
        state.set_last_outcome(IterOutcome::OkNewSchema);
        assert_eq!(state.final_outcome(true), IterOutcome::OkNewSchema);
        assert_eq!(state.final_outcome(false), IterOutcome::Ok);
    }

    #[test]
    fn test_emit_waits_for_boundary() {
        let mut state = ProtocolState::new();
        state.set_last_outcome(IterOutcome::Emit);
        assert_eq!(state.final_outcome(true), IterOutcome::Ok);
        assert_eq!(state.final_outcome(true), IterOutcome::Ok);
        assert_eq!(state.final_outcome(false), IterOutcome::Emit);
        assert_eq!(state.final_outcome(false), IterOutcome::Ok);
    }

    #[test]
    fn test_outcome_classes() {
        assert!(IterOutcome::Emit.has_data());
        assert!(!IterOutcome::NotYet.has_data());
        assert!(IterOutcome::Stop.is_terminal());
        assert_eq!(IterOutcome::OkNewSchema.to_string(), "OK_NEW_SCHEMA");
    }
}
