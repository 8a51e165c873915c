//! Synchronization primitives.
//!
//! - [`SpinLock`] guards per-CPU commitment and run-queue state, the
//!   location-group table and the movable utility list.
//! - [`OwnerCell`] is a lock-free slot recording which thread or process
//!   currently owns a CPU, claimed with a single compare-and-swap.

mod loom_compat;
mod owner;
mod spinlock;

pub use owner::OwnerCell;
pub use spinlock::{SpinLock, SpinLockGuard};
