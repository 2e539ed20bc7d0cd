/// RAII handles over accountant bytes
///
/// `Reservation` holds a resizable byte count against an accountant and gives
/// it back on drop. `AccountedVec` is a typed buffer whose backing storage is
/// charged to an accountant before it is allocated.
use crate::error::EngineResult;
use crate::memory::accountant::Accountant;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::warn;

pub struct Reservation {
    accountant: Arc<Accountant>,
    size: u64,
}

impl Reservation {
    /// Reservation of zero bytes
    pub fn empty(accountant: &Arc<Accountant>) -> Self {
        Self {
            accountant: Arc::clone(accountant),
            size: 0,
        }
    }

    /// Reserve `size` bytes or fail with `OutOfMemory`
    pub fn try_new(accountant: &Arc<Accountant>, size: u64) -> EngineResult<Self> {
        accountant.try_allocate(size)?;
        Ok(Self {
            accountant: Arc::clone(accountant),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    /// Grow or shrink the reservation; a refused growth leaves it unchanged
    pub fn try_resize(&mut self, new_size: u64) -> EngineResult<()> {
        if new_size > self.size {
            self.accountant.try_allocate(new_size - self.size)?;
        } else if new_size < self.size {
            self.accountant.release(self.size - new_size)?;
        }
        self.size = new_size;
        Ok(())
    }

    pub fn try_grow(&mut self, additional: u64) -> EngineResult<()> {
        self.try_resize(self.size + additional)
    }

    /// Release everything held so far
    pub fn free(&mut self) {
        if self.size == 0 {
            return;
        }
        if let Err(e) = self.accountant.release(self.size) {
            warn!(
                accountant = self.accountant.name(),
                size = self.size,
                error = %e,
                "Failed to release reservation"
            );
        }
        self.size = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.free();
    }
}

/// Fixed-length buffer charged to an accountant
pub struct AccountedVec<T> {
    data: Vec<T>,
    reservation: Reservation,
}

impl<T: Copy + Default> AccountedVec<T> {
    /// Charge `len * size_of::<T>()` bytes, then allocate a zeroed buffer
    pub fn try_new(accountant: &Arc<Accountant>, len: usize) -> EngineResult<Self> {
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        let reservation = Reservation::try_new(accountant, bytes)?;
        Ok(Self {
            data: vec![T::default(); len],
            reservation,
        })
    }
}

impl<T> AccountedVec<T> {
    pub fn accounted_bytes(&self) -> u64 {
        self.reservation.size()
    }
}

impl<T> Deref for AccountedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for AccountedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPolicy;

    #[test]
    fn test_reservation_released_on_drop() {
        let root = Accountant::new_root("root", 1000, MemoryPolicy::strict());
        {
            let mut r = Reservation::try_new(&root, 100).unwrap();
            assert_eq!(root.allocated(), 100);
            r.try_resize(300).unwrap();
            assert_eq!(root.allocated(), 300);
            r.try_resize(50).unwrap();
            assert_eq!(root.allocated(), 50);
        }
        assert_eq!(root.allocated(), 0);
    }

    #[test]
    fn test_refused_growth_keeps_size() {
        let root = Accountant::new_root("root", 100, MemoryPolicy::strict());
        let mut r = Reservation::try_new(&root, 60).unwrap();
        assert!(r.try_grow(60).is_err());
        assert_eq!(r.size(), 60);
        assert_eq!(root.allocated(), 60);
    }

    #[test]
    fn test_accounted_vec_charges_bytes() {
        let root = Accountant::new_root("root", 1000, MemoryPolicy::strict());
        let v = AccountedVec::<u16>::try_new(&root, 100).unwrap();
        assert_eq!(v.len(), 100);
        assert_eq!(root.allocated(), 200);
        drop(v);
        assert_eq!(root.allocated(), 0);
        assert!(AccountedVec::<u16>::try_new(&root, 600).is_err());
    }
}
