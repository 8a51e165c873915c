//! Core types and synchronization primitives for the LWK scheduler.
//!
//! This crate contains the host-testable building blocks shared by the
//! scheduler core and its host tools: typed identifiers, fixed-width CPU
//! and NUMA node masks, the pluggable kernel logger, and the spin lock
//! and owner-cell primitives used for cross-CPU coordination.
//!
//! Everything here builds for `no_std` targets and can be tested with
//! `cargo test` and loom on the host.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cpumask;
pub mod id;
pub mod log;
pub mod sync;
