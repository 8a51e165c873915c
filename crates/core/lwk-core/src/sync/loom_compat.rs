//! Loom compatibility shim.
//!
//! Under `cfg(loom)` the owner cell is built on loom's atomics so its
//! claim protocol can be model-checked; otherwise it uses `core` atomics.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicU32, Ordering};
