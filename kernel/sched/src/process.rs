//! HPC process state.
//!
//! An [`LwkProcess`] is created by `on_process_init` and lives until
//! `on_process_exit`. It carries the process's view of the partition (its
//! reserved CPUs in canonical order and the general-purpose CPUs open to
//! its utility threads), the options it was launched with, and the list of
//! movable utility threads.
//!
//! The movable list is ordered most recent first: placement pushes to the
//! front and eviction pops from the front. Utility threads are allocated
//! from the end of the CPU sequence, so evicting the newest one frees the
//! CPU that is next in line for a compute worker.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use lwk_core::cpumask::CpuMask;
use lwk_core::id::{CpuId, Pid, Tid};
use lwk_core::sync::SpinLock;

use crate::error::SchedError;
use crate::options::LwkOptions;

/// CPUs a process was launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLayout {
    /// Reserved CPUs of the process.
    pub lwkcpus: CpuMask,
    /// `lwkcpus` in placement order.
    pub sequence: Vec<CpuId>,
    /// General-purpose CPUs utility threads may use.
    pub util_cpus: CpuMask,
    /// Affinity of the launching thread before it moved to the partition.
    pub original_allowed: CpuMask,
}

impl ProcessLayout {
    /// Builds a layout whose sequence is `lwkcpus` in ascending order.
    pub fn new(lwkcpus: CpuMask, util_cpus: CpuMask, original_allowed: CpuMask) -> Self {
        Self {
            lwkcpus,
            sequence: lwkcpus.iter().collect(),
            util_cpus,
            original_allowed,
        }
    }

    /// Replaces the placement order.
    #[must_use]
    pub fn with_sequence(mut self, sequence: Vec<CpuId>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Checks the layout against itself.
    ///
    /// The sequence must list every reserved CPU exactly once, and the
    /// utility CPUs must lie outside the reserved set.
    pub fn validate(&self) -> Result<(), SchedError> {
        if self.lwkcpus.is_empty() {
            return Err(SchedError::EmptyPartition);
        }
        let mut seen = CpuMask::new();
        for &cpu in &self.sequence {
            if !self.lwkcpus.contains(cpu) || seen.contains(cpu) {
                return Err(SchedError::NotPartitionCpu(cpu));
            }
            seen.set(cpu);
        }
        if let Some(missing) = self.lwkcpus.and_not(&seen).first() {
            return Err(SchedError::NotPartitionCpu(missing));
        }
        if let Some(both) = self.util_cpus.and(&self.lwkcpus).first() {
            return Err(SchedError::NotPartitionCpu(both));
        }
        Ok(())
    }

    /// First CPU of the placement order.
    pub fn first(&self) -> Option<CpuId> {
        self.sequence.first().copied()
    }
}

/// Scheduler state of one HPC process.
#[derive(Debug)]
pub struct LwkProcess {
    pid: Pid,
    options: LwkOptions,
    layout: ProcessLayout,
    threads_created: AtomicU32,
    util_list: SpinLock<VecDeque<Tid>>,
}

impl LwkProcess {
    /// Creates the state for `pid`.
    pub fn new(pid: Pid, layout: ProcessLayout, options: LwkOptions) -> Self {
        Self {
            pid,
            options,
            layout,
            threads_created: AtomicU32::new(0),
            util_list: SpinLock::named("process.util_list", VecDeque::new()),
        }
    }

    /// Process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Launch options.
    pub fn options(&self) -> &LwkOptions {
        &self.options
    }

    /// CPU layout.
    pub fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    /// Counts one more thread creation and returns the new total.
    pub fn note_thread_created(&self) -> u32 {
        self.threads_created.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Threads created so far, not counting the founding thread.
    pub fn threads_created(&self) -> u32 {
        self.threads_created.load(Ordering::Relaxed)
    }

    /// Adds a movable utility thread at the front of the list.
    pub fn push_movable(&self, tid: Tid) {
        self.util_list.lock().push_front(tid);
    }

    /// Removes and returns the most recently placed movable thread.
    pub fn pop_movable(&self) -> Option<Tid> {
        self.util_list.lock().pop_front()
    }

    /// Removes `tid` from the movable list; returns whether it was there.
    pub fn remove_movable(&self, tid: Tid) -> bool {
        let mut list = self.util_list.lock();
        match list.iter().position(|&t| t == tid) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the movable list, front first.
    pub fn movable(&self) -> Vec<Tid> {
        self.util_list.lock().iter().copied().collect()
    }
}
