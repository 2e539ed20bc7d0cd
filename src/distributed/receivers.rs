/// Receiver bookkeeping for a sending exchange
///
/// Receivers are addressed by position (the partition bucket) and identified
/// by minor fragment id. Any thread may report that a receiver finished; the
/// sender polls `all_finished()` between batches.
use crate::distributed::tunnel::DataTunnel;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One downstream minor fragment and its tunnel
#[derive(Clone)]
pub struct Destination {
    pub minor_fragment_id: u32,
    pub tunnel: Arc<dyn DataTunnel>,
}

impl Destination {
    pub fn new(minor_fragment_id: u32, tunnel: Arc<dyn DataTunnel>) -> Self {
        Self {
            minor_fragment_id,
            tunnel,
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("minor_fragment_id", &self.minor_fragment_id)
            .finish()
    }
}

#[derive(Debug)]
pub struct ReceiverStatus {
    minor_fragment_ids: Vec<u32>,
    finished: Vec<AtomicBool>,
    remaining: AtomicUsize,
}

impl ReceiverStatus {
    pub fn new(minor_fragment_ids: Vec<u32>) -> Self {
        let finished = minor_fragment_ids.iter().map(|_| AtomicBool::new(false)).collect();
        let remaining = AtomicUsize::new(minor_fragment_ids.len());
        Self {
            minor_fragment_ids,
            finished,
            remaining,
        }
    }

    pub fn len(&self) -> usize {
        self.minor_fragment_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minor_fragment_ids.is_empty()
    }

    pub fn minor_fragment_id(&self, index: usize) -> Option<u32> {
        self.minor_fragment_ids.get(index).copied()
    }

    /// Record that `minor_fragment_id` wants no more data; returns whether
    /// this call was the first report for it
    pub fn mark_finished(&self, minor_fragment_id: u32) -> bool {
        let Some(index) = self
            .minor_fragment_ids
            .iter()
            .position(|&id| id == minor_fragment_id)
        else {
            debug!(minor_fragment_id, "Finish reported for unknown receiver");
            return false;
        };
        if self.finished[index].swap(true, Ordering::SeqCst) {
            return false;
        }
        let left = self.remaining.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(minor_fragment_id, remaining = left, "Receiver finished");
        true
    }

    pub fn is_finished(&self, index: usize) -> bool {
        self.finished
            .get(index)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn all_finished(&self) -> bool {
        self.remaining() == 0
    }
}
