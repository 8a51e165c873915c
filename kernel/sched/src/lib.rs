//! Commitment-aware scheduler for a reserved CPU partition.
//!
//! A set of CPUs is taken out of general-purpose use and handed to HPC
//! processes. Every reserved CPU carries counters of the compute and
//! utility threads committed to it; placement walks the process's CPU
//! sequence and picks the least committed CPU matching the requested
//! cache or NUMA locality. Utility threads can be steered by placement
//! hints, grouped by key, or pushed to general-purpose CPUs when compute
//! threads need room. Foreign threads that land on a reserved CPU are
//! assimilated as guests and given back unchanged when they leave.
//!
//! [`LwkScheduler`] owns all state and implements the host-facing
//! [`SchedClass`] hooks. The crate is `no_std` and host-testable.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod assimilate;
pub mod class;
pub mod commit;
pub mod error;
pub mod groups;
pub mod hints;
pub mod idle;
pub mod options;
pub mod placement;
pub mod process;
pub mod runqueue;
pub mod scheduler;
pub mod slot;
pub mod stats;
pub mod thread;
pub mod topology;
pub mod utility;

pub use class::{EnqueueFlags, SchedClass, WakeReason};
pub use error::SchedError;
pub use hints::{Behavior, CloneFlags, Location, PlacementRequest, ResultSlot};
pub use options::LwkOptions;
pub use process::ProcessLayout;
pub use scheduler::{CloneKind, LwkScheduler};
pub use thread::ThreadRecord;
pub use topology::{TopologySource, UniformMachine};
