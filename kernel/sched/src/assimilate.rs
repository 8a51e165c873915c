//! Assimilation of threads arriving on a CPU.
//!
//! Every thread is run through [`assimilate`] just before it is queued on
//! a CPU. Threads of an HPC process that reach a reserved CPU become
//! compute workers; the per-CPU idle task becomes [`ThreadRole::Idle`];
//! any other thread becomes a [`ThreadRole::Guest`] carrying its previous
//! scheduling state. A guest that later shows up on a general-purpose CPU
//! gets that state back unchanged.
//!
//! A thread counts as assimilated while it belongs to the reserved class.
//! Process threads may already carry their role before they first reach a
//! reserved CPU; the role is kept and only the class and priority change.

use lwk_core::kwarn;

use crate::options::LwkOptions;
use crate::slot::CpuSlot;
use crate::stats::Counter;
use crate::thread::{DEFAULT_TIMESLICE, HostClass, SavedSched, SchedParams, ThreadRecord, ThreadRole};

/// Command-name prefixes of kernel helpers expected on reserved CPUs.
const EXPECTED_GUESTS: [&str; 3] = ["ksoftirqd", "cpuhp", "mos_idle"];

/// What [`assimilate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assimilation {
    /// Nothing to do.
    Unchanged,
    /// An HPC process thread was converted to a compute worker.
    Launched,
    /// The thread is the CPU's idle task.
    Idle,
    /// A foreign thread was taken in as a guest.
    Guest,
    /// A guest was handed back to its original scheduler.
    GaveBack,
    /// The thread's host class is never assimilated.
    Skipped,
}

/// Brings `thread` under (or out of) this scheduler as it is queued on
/// `slot`.
///
/// `process` carries the options of the thread's HPC process, if it
/// belongs to one.
pub fn assimilate(thread: &mut ThreadRecord, slot: &CpuSlot, process: Option<&LwkOptions>) -> Assimilation {
    if thread.on_lwk_class() {
        if slot.is_lwk() {
            return Assimilation::Unchanged;
        }
        if let ThreadRole::Guest { saved } = thread.role {
            thread.sched = saved.params;
            thread.time_slice = saved.time_slice;
            thread.orig_time_slice = saved.orig_time_slice;
            thread.role = ThreadRole::Unassimilated;
            slot.stats().bump(Counter::Givebacks);
            return Assimilation::GaveBack;
        }
    }
    if !slot.is_lwk() {
        return Assimilation::Unchanged;
    }

    if let Some(options) = process {
        let slice = options.rr_slice.unwrap_or(DEFAULT_TIMESLICE);
        thread.sched = SchedParams::lwk(options.round_robin());
        if thread.role == ThreadRole::Unassimilated {
            thread.role = ThreadRole::Normal;
        }
        thread.time_slice = slice;
        thread.orig_time_slice = slice;
        return Assimilation::Launched;
    }

    match thread.sched.class {
        HostClass::Stop | HostClass::Idle | HostClass::Lwk => return Assimilation::Skipped,
        HostClass::Deadline | HostClass::RealTime | HostClass::Fair => {}
    }
    if !EXPECTED_GUESTS.iter().any(|p| thread.comm.starts_with(p)) {
        kwarn!(
            "assimilate: unexpected thread {} ({}) on cpu {}, allowed {}",
            thread.tid,
            thread.comm,
            slot.cpu(),
            thread.allowed
        );
    }

    let saved = SavedSched {
        params: thread.sched,
        time_slice: thread.time_slice,
        orig_time_slice: thread.orig_time_slice,
    };
    thread.sched.class = HostClass::Lwk;
    thread.time_slice = DEFAULT_TIMESLICE;
    thread.orig_time_slice = DEFAULT_TIMESLICE;
    if slot.idle_tid() == Some(thread.tid) {
        thread.role = ThreadRole::Idle;
        Assimilation::Idle
    } else {
        thread.role = ThreadRole::Guest { saved };
        slot.stats().bump(Counter::Guests);
        Assimilation::Guest
    }
}

/// Turns an idle task whose CPU is leaving the partition into a guest, so
/// the next [`assimilate`] on a general-purpose CPU hands it back.
pub fn release_idle(thread: &mut ThreadRecord) {
    if thread.role == ThreadRole::Idle {
        thread.role = ThreadRole::Guest {
            saved: SavedSched {
                params: SchedParams::idle_task(),
                time_slice: DEFAULT_TIMESLICE,
                orig_time_slice: DEFAULT_TIMESLICE,
            },
        };
    }
}
