/// Accountant: hierarchical, lock-free memory quota tracking
///
/// Every operator owns one accountant, parented to the fragment's (and through
/// it the query's) accountant. Allocation is optimistic: the size is added to
/// `allocated` first and unwound afterwards if this node or an ancestor
/// refuses it. Under concurrency another thread may therefore observe
/// `allocated > limit` for the duration of a request that will come back
/// `FailedLocal`; the bound only holds once that request has settled.
///
/// Bytes within a node's reservation never travel to the parent; only the
/// portion above the reservation is requested from (and returned to) it.
use crate::error::{EngineError, EngineResult};
use crate::memory::atomic::AtomicExtremum;
use crate::memory::policy::MemoryPolicy;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Success,
    /// This node's limit (plus grace, if lenient) was exceeded
    FailedLocal,
    /// An ancestor refused the portion beyond this node's reservation
    FailedParent,
}

impl AllocationOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, AllocationOutcome::Success)
    }
}

pub struct Accountant {
    name: String,
    parent: Option<Arc<Accountant>>,
    reservation: i64,
    limit: AtomicI64,
    allocated: AtomicI64,
    peak: AtomicI64,
    lenient: AtomicBool,
    policy: MemoryPolicy,
    open_children: AtomicUsize,
    closed: AtomicBool,
}

impl fmt::Debug for Accountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accountant")
            .field("name", &self.name)
            .field("reservation", &self.reservation)
            .field("limit", &self.limit())
            .field("allocated", &self.allocated())
            .field("peak", &self.peak())
            .field("lenient", &self.is_lenient())
            .finish()
    }
}

fn to_signed(size: u64) -> Option<i64> {
    i64::try_from(size).ok()
}

impl Accountant {
    /// Create the root of an accountant tree
    pub fn new_root(name: impl Into<String>, limit: u64, policy: MemoryPolicy) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            reservation: 0,
            limit: AtomicI64::new(to_signed(limit).unwrap_or(i64::MAX)),
            allocated: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            lenient: AtomicBool::new(policy.lenient),
            policy,
            open_children: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a child that draws `reservation` bytes from this node up front
    ///
    /// Fails with `OutOfMemory` when the reservation cannot be obtained; the
    /// owning operator cannot run without it.
    pub fn new_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        reservation: u64,
        limit: u64,
    ) -> EngineResult<Arc<Accountant>> {
        self.new_child_with_policy(name, reservation, limit, self.policy)
    }

    pub fn new_child_with_policy(
        self: &Arc<Self>,
        name: impl Into<String>,
        reservation: u64,
        limit: u64,
        policy: MemoryPolicy,
    ) -> EngineResult<Arc<Accountant>> {
        let name = name.into();
        if self.is_closed() {
            return Err(EngineError::internal(format!(
                "cannot create accountant '{}' under closed accountant '{}'",
                name, self.name
            )));
        }
        if reservation > limit {
            return Err(EngineError::internal(format!(
                "accountant '{}' reservation {} exceeds its limit {}",
                name, reservation, limit
            )));
        }
        let reservation_signed = to_signed(reservation).ok_or_else(|| {
            EngineError::internal(format!("reservation {} out of range", reservation))
        })?;

        if reservation > 0 {
            let outcome = self.allocate(reservation);
            if !outcome.is_ok() {
                warn!(
                    accountant = %name,
                    parent = %self.name,
                    reservation = reservation,
                    outcome = ?outcome,
                    "Initial reservation refused"
                );
                return Err(EngineError::out_of_memory_with_usage(
                    format!(
                        "failure trying to allocate initial reservation for '{}': attempted {} bytes, outcome {:?}",
                        name, reservation, outcome
                    ),
                    reservation,
                    self.limit().max(0) as u64,
                    self.allocated().max(0) as u64,
                ));
            }
        }

        self.open_children.fetch_add(1, Ordering::SeqCst);
        debug!(
            accountant = %name,
            parent = %self.name,
            reservation = reservation,
            limit = limit,
            "Accountant opened"
        );

        Ok(Arc::new(Self {
            name,
            parent: Some(Arc::clone(self)),
            reservation: reservation_signed,
            limit: AtomicI64::new(to_signed(limit).unwrap_or(i64::MAX)),
            allocated: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            lenient: AtomicBool::new(policy.lenient),
            policy,
            open_children: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Reserve `size` bytes here and, beyond the reservation, at every ancestor
    ///
    /// All-or-nothing from the caller's point of view: a failed request leaves
    /// `allocated` where it was.
    pub fn allocate(&self, size: u64) -> AllocationOutcome {
        let Some(size) = to_signed(size) else {
            return AllocationOutcome::FailedLocal;
        };
        let outcome = self.allocate_inner(size, true, false);
        if !outcome.is_ok() {
            self.release_inner(size);
        }
        outcome
    }

    /// Like `allocate`, mapping failure to an `OutOfMemory` error
    pub fn try_allocate(&self, size: u64) -> EngineResult<()> {
        match self.allocate(size) {
            AllocationOutcome::Success => Ok(()),
            outcome => Err(EngineError::out_of_memory_with_usage(
                format!(
                    "accountant '{}' refused {} bytes ({:?})",
                    self.name, size, outcome
                ),
                size,
                self.limit().max(0) as u64,
                self.allocated().max(0) as u64,
            )),
        }
    }

    /// Record `size` bytes even if it breaks the limit; the bytes stay
    /// accounted either way. Returns whether the allocation was within limits.
    pub fn force_allocate(&self, size: u64) -> bool {
        let size = to_signed(size).unwrap_or(i64::MAX);
        self.allocate_inner(size, true, true).is_ok()
    }

    fn allocate_inner(&self, size: i64, incoming_update_peak: bool, force: bool) -> AllocationOutcome {
        let new_local = self.allocated.fetch_add(size, Ordering::SeqCst) + size;
        let beyond_reservation = new_local - self.reservation;
        let limit = self.limit.load(Ordering::SeqCst);
        let mut beyond_limit = new_local > limit;

        if beyond_limit && self.lenient.load(Ordering::Relaxed) {
            let grace = self.policy.grace_for(limit);
            beyond_limit = new_local > limit.saturating_add(grace);
            if !beyond_limit {
                warn!(
                    accountant = %self.name,
                    allocated = new_local,
                    limit = limit,
                    grace = grace,
                    "Allocation exceeded limit, absorbed by lenient grace margin"
                );
            }
        }

        let update_peak = force || (incoming_update_peak && !beyond_limit);

        let mut parent_outcome = AllocationOutcome::Success;
        if beyond_reservation > 0 {
            if let Some(parent) = &self.parent {
                let parent_request = beyond_reservation.min(size);
                parent_outcome = parent.allocate_inner(parent_request, update_peak, force);
            }
        }

        let outcome = if beyond_limit {
            AllocationOutcome::FailedLocal
        } else if !parent_outcome.is_ok() {
            AllocationOutcome::FailedParent
        } else {
            AllocationOutcome::Success
        };

        if update_peak {
            self.peak.update_max(new_local);
        }

        outcome
    }

    /// Give `size` bytes back; only the part above the reservation reaches the parent
    pub fn release(&self, size: u64) -> EngineResult<()> {
        let size = to_signed(size)
            .ok_or_else(|| EngineError::internal(format!("release of {} bytes out of range", size)))?;
        let new_size = self.allocated.fetch_sub(size, Ordering::SeqCst) - size;
        if new_size < 0 {
            self.allocated.fetch_add(size, Ordering::SeqCst);
            return Err(EngineError::internal(format!(
                "accountant '{}' released {} bytes but held only {}",
                self.name,
                size,
                new_size + size
            )));
        }
        self.propagate_release(new_size, size);
        Ok(())
    }

    fn release_inner(&self, size: i64) {
        let new_size = self.allocated.fetch_sub(size, Ordering::SeqCst) - size;
        debug_assert!(new_size >= 0, "accounted size went negative");
        if new_size < 0 {
            warn!(accountant = %self.name, allocated = new_size, "Accounted size went negative");
        }
        self.propagate_release(new_size, size);
    }

    fn propagate_release(&self, new_size: i64, size: i64) {
        let original_size = new_size + size;
        if original_size > self.reservation {
            if let Some(parent) = &self.parent {
                let possible = original_size - self.reservation;
                parent.release_inner(size.min(possible));
            }
        }
    }

    /// Return the reservation to the parent. Not thread-safe: call from the
    /// owning thread once concurrent users have quiesced. Idempotent.
    pub fn close(&self) -> EngineResult<()> {
        let children = self.open_children.load(Ordering::SeqCst);
        if children > 0 {
            return Err(EngineError::internal(format!(
                "accountant '{}' closed while {} child accountant(s) are still open",
                self.name, children
            )));
        }
        self.close_inner();
        Ok(())
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let held = self.allocated();
        if held > 0 {
            warn!(
                accountant = %self.name,
                allocated = held,
                "Accountant closed with outstanding allocations"
            );
        }
        if let Some(parent) = &self.parent {
            if self.reservation > 0 {
                parent.release_inner(self.reservation);
            }
            parent.open_children.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(accountant = %self.name, peak = self.peak(), "Accountant closed");
    }

    /// Opt into grace-margin allocation; refused under a strict policy
    pub fn set_lenient(&self) -> bool {
        if self.policy.leniency_locked {
            return false;
        }
        self.lenient.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit
            .store(to_signed(limit).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Accountant>> {
        self.parent.as_ref()
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    pub fn reservation(&self) -> i64 {
        self.reservation
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn is_over_limit(&self) -> bool {
        self.allocated() > self.limit()
            || self.parent.as_ref().is_some_and(|p| p.is_over_limit())
    }

    /// Bytes that could still be allocated here without failing
    pub fn headroom(&self) -> i64 {
        let local = self.limit() - self.allocated();
        match &self.parent {
            None => local,
            Some(parent) => {
                let reserved_headroom = (self.reservation - self.allocated()).max(0);
                local.min(parent.headroom() + reserved_headroom)
            }
        }
    }

    pub fn open_children(&self) -> usize {
        self.open_children.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Accountant {
    fn drop(&mut self) {
        // children hold an Arc to us, so every child is gone by now
        self.close_inner();
    }
}
