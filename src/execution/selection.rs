/// SelectionVector2: 16-bit row indirection over a batch
///
/// Holds which rows of the underlying batch are visible and in what order. The
/// column buffers are never touched; only indices move. Backing storage is
/// charged to the owning operator's accountant.
use crate::error::{EngineError, EngineResult};
use crate::memory::{AccountedVec, Accountant};
use std::fmt;
use std::sync::Arc;

/// Rows addressable with a 16-bit index
pub const MAX_SV2_CAPACITY: usize = u16::MAX as usize + 1;

#[derive(Default)]
pub struct SelectionVector2 {
    buffer: Option<AccountedVec<u16>>,
    record_count: usize,
    batch_actual_record_count: usize,
}

impl fmt::Debug for SelectionVector2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionVector2")
            .field("capacity", &self.capacity())
            .field("record_count", &self.record_count)
            .field("indices", &self.as_slice())
            .finish()
    }
}

impl SelectionVector2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any previous storage and allocate room for `size` indices
    pub fn allocate_new(&mut self, accountant: &Arc<Accountant>, size: usize) -> EngineResult<()> {
        if size > MAX_SV2_CAPACITY {
            return Err(EngineError::execution(format!(
                "selection vector of {} entries exceeds the 16-bit limit of {}",
                size, MAX_SV2_CAPACITY
            )));
        }
        self.clear();
        self.buffer = Some(AccountedVec::try_new(accountant, size)?);
        Ok(())
    }

    /// Make room for at least `size` indices, keeping larger storage as is
    pub fn ensure_capacity(&mut self, accountant: &Arc<Accountant>, size: usize) -> EngineResult<()> {
        if self.buffer.is_some() && self.capacity() >= size {
            self.record_count = 0;
            return Ok(());
        }
        self.allocate_new(accountant, size)
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Number of visible rows
    pub fn count(&self) -> usize {
        self.record_count
    }

    pub fn set_record_count(&mut self, count: usize) -> EngineResult<()> {
        if count > self.capacity() {
            return Err(EngineError::internal(format!(
                "selection vector count {} exceeds capacity {}",
                count,
                self.capacity()
            )));
        }
        self.record_count = count;
        Ok(())
    }

    /// Row count of the batch this vector points into
    pub fn batch_actual_record_count(&self) -> usize {
        self.batch_actual_record_count
    }

    pub fn set_batch_actual_record_count(&mut self, count: usize) {
        self.batch_actual_record_count = count;
    }

    /// Original row index at `position`
    #[inline]
    pub fn index(&self, position: usize) -> usize {
        self.as_slice()[position] as usize
    }

    /// Writable index slots, sized to the allocated capacity
    pub fn slots_mut(&mut self) -> EngineResult<&mut [u16]> {
        self.buffer
            .as_deref_mut()
            .ok_or_else(|| EngineError::internal("selection vector used before allocation"))
    }

    /// Visible indices, `count()` long
    pub fn as_slice(&self) -> &[u16] {
        match &self.buffer {
            Some(buffer) => &buffer[..self.record_count],
            None => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.as_slice().iter().map(|&i| i as usize)
    }

    /// Release the storage back to the accountant
    pub fn clear(&mut self) {
        self.buffer = None;
        self.record_count = 0;
        self.batch_actual_record_count = 0;
    }

    /// Fill with `0..count`, used when every row passes
    pub fn fill_identity(&mut self, accountant: &Arc<Accountant>, count: usize) -> EngineResult<()> {
        self.ensure_capacity(accountant, count)?;
        let slots = self.slots_mut()?;
        for (slot, row) in slots.iter_mut().zip(0..count) {
            *slot = row as u16;
        }
        self.set_record_count(count)
    }
}
