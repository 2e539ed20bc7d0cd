/// Memory accounting
///
/// A tree of `Accountant`s (query -> fragment -> operator) tracks every byte an
/// operator holds in batch buffers. Leaf handles (`Reservation`,
/// `AccountedVec`) give their bytes back when dropped.
pub mod accountant;
pub mod atomic;
pub mod policy;
pub mod reservation;

pub use accountant::{Accountant, AllocationOutcome};
pub use atomic::AtomicExtremum;
pub use policy::MemoryPolicy;
pub use reservation::{AccountedVec, Reservation};
