/// Per-fragment mailbox for runtime filters
///
/// Build-side fragments publish partial filters keyed by identifier. A filter
/// becomes visible once the expected number of parts has been aggregated
/// (one by default). Probe-side operators either poll with `get` or block on
/// `wait_for` with a deadline.
use crate::error::EngineResult;
use crate::runtime_filter::writable::RuntimeFilterWritable;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Slot {
    expected: usize,
    received: usize,
    partial: Option<RuntimeFilterWritable>,
    ready: Option<Arc<RuntimeFilterWritable>>,
}

#[derive(Debug, Default)]
pub struct RuntimeFilterSink {
    slots: Mutex<HashMap<i64, Slot>>,
    arrived: Condvar,
}

impl RuntimeFilterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `parts` partial filters before `identifier` becomes visible
    pub fn expect_parts(&self, identifier: i64, parts: usize) {
        let mut slots = self.slots.lock();
        slots.entry(identifier).or_default().expected = parts.max(1);
    }

    /// Aggregate a partial filter; returns whether the filter is now complete
    pub fn publish(&self, writable: RuntimeFilterWritable) -> EngineResult<bool> {
        let identifier = writable.identifier();
        let mut slots = self.slots.lock();
        let slot = slots.entry(identifier).or_default();
        if slot.ready.is_some() {
            debug!(identifier = identifier, "Late runtime filter part ignored");
            return Ok(true);
        }
        match slot.partial.as_mut() {
            Some(existing) => existing.aggregate(&writable)?,
            None => slot.partial = Some(writable),
        }
        slot.received += 1;

        let expected = slot.expected.max(1);
        if slot.received < expected {
            debug!(
                identifier = identifier,
                received = slot.received,
                expected = expected,
                "Runtime filter part received"
            );
            return Ok(false);
        }
        if let Some(complete) = slot.partial.take() {
            info!(
                identifier = identifier,
                parts = slot.received,
                bytes = complete.memory_usage_bytes(),
                "Runtime filter complete"
            );
            slot.ready = Some(Arc::new(complete));
        }
        drop(slots);
        self.arrived.notify_all();
        Ok(true)
    }

    /// Complete filter for `identifier`, if it has arrived
    pub fn get(&self, identifier: i64) -> Option<Arc<RuntimeFilterWritable>> {
        self.slots
            .lock()
            .get(&identifier)
            .and_then(|s| s.ready.clone())
    }

    /// Block up to `timeout` for `identifier` to complete
    pub fn wait_for(&self, identifier: i64, timeout: Duration) -> Option<Arc<RuntimeFilterWritable>> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            if let Some(ready) = slots.get(&identifier).and_then(|s| s.ready.clone()) {
                return Some(ready);
            }
            if self.arrived.wait_until(&mut slots, deadline).timed_out() {
                return slots.get(&identifier).and_then(|s| s.ready.clone());
            }
        }
    }

    /// Drop every filter, e.g. when the fragment finishes
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
