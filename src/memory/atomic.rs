/// Lock-free extremum updates for atomic integers
///
/// `update_max` / `update_min` retry a compare-exchange until the stored value
/// is at least (at most) the candidate. Used for the accountant's peak and for
/// per-receiver record count extremes in the exchange.
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub trait AtomicExtremum {
    type Value: Copy + Ord;

    /// Raise the stored value to `candidate` if larger; returns the value seen before
    fn update_max(&self, candidate: Self::Value) -> Self::Value;

    /// Lower the stored value to `candidate` if smaller; returns the value seen before
    fn update_min(&self, candidate: Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_extremum {
    ($($atomic:ty => $int:ty),* $(,)?) => {
        $(
            impl AtomicExtremum for $atomic {
                type Value = $int;

                #[inline]
                fn update_max(&self, candidate: $int) -> $int {
                    let mut current = self.load(Ordering::Relaxed);
                    loop {
                        if candidate <= current {
                            return current;
                        }
                        match self.compare_exchange_weak(
                            current,
                            candidate,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        ) {
                            Ok(previous) => return previous,
                            Err(actual) => current = actual,
                        }
                    }
                }

                #[inline]
                fn update_min(&self, candidate: $int) -> $int {
                    let mut current = self.load(Ordering::Relaxed);
                    loop {
                        if candidate >= current {
                            return current;
                        }
                        match self.compare_exchange_weak(
                            current,
                            candidate,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        ) {
                            Ok(previous) => return previous,
                            Err(actual) => current = actual,
                        }
                    }
                }
            }
        )*
    };
}

impl_atomic_extremum!(
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
);
