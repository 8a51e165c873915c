//! Per-CPU scheduler statistics.
//!
//! Counters are plain relaxed atomics: they are written from the owning
//! CPU's hot paths and only read for reporting, so no ordering with other
//! scheduler state is required. Peak values use `fetch_max`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lwk_core::id::{CpuId, Pid};
use lwk_core::kinfo;

use crate::groups::GroupKey;

/// Event counters that only ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A guest thread was picked to run.
    GuestDispatch,
    /// A timer tick was taken on a reserved CPU.
    TimerPop,
    /// A system call was migrated off the CPU.
    SyscallMigration,
    /// An affinity change was requested.
    SetAffinity,
    /// A utility thread was pushed to a general-purpose CPU.
    Pushed,
    /// A foreign thread was assimilated as a guest.
    Guests,
    /// A guest thread was handed back to its original scheduler.
    Givebacks,
}

/// Live counters of one CPU slot.
#[derive(Debug, Default)]
pub struct CpuStats {
    max_compute_level: AtomicU32,
    max_util_level: AtomicU32,
    max_running: AtomicU32,
    guest_dispatch: AtomicU64,
    timer_pop: AtomicU64,
    sysc_migr: AtomicU64,
    setaffinity: AtomicU64,
    pushed: AtomicU64,
    guests: AtomicU64,
    givebacks: AtomicU64,
}

impl CpuStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::GuestDispatch => &self.guest_dispatch,
            Counter::TimerPop => &self.timer_pop,
            Counter::SyscallMigration => &self.sysc_migr,
            Counter::SetAffinity => &self.setaffinity,
            Counter::Pushed => &self.pushed,
            Counter::Guests => &self.guests,
            Counter::Givebacks => &self.givebacks,
        }
    }

    /// Increments `counter`.
    pub fn bump(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Records a compute commitment level.
    pub fn record_compute_level(&self, level: u32) {
        self.max_compute_level.fetch_max(level, Ordering::Relaxed);
    }

    /// Records a utility commitment level.
    pub fn record_util_level(&self, level: u32) {
        self.max_util_level.fetch_max(level, Ordering::Relaxed);
    }

    /// Records a run-queue depth.
    pub fn record_running(&self, running: u32) {
        self.max_running.fetch_max(running, Ordering::Relaxed);
    }

    /// Clears the per-launch counters. Guest and giveback totals span the
    /// whole partition lifetime and are kept.
    pub fn reset_launch(&self) {
        for a in [&self.max_compute_level, &self.max_util_level, &self.max_running] {
            a.store(0, Ordering::Relaxed);
        }
        for c in [
            Counter::GuestDispatch,
            Counter::TimerPop,
            Counter::SyscallMigration,
            Counter::SetAffinity,
            Counter::Pushed,
        ] {
            self.counter(c).store(0, Ordering::Relaxed);
        }
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            max_compute_level: self.max_compute_level.load(Ordering::Relaxed),
            max_util_level: self.max_util_level.load(Ordering::Relaxed),
            max_running: self.max_running.load(Ordering::Relaxed),
            guest_dispatch: self.guest_dispatch.load(Ordering::Relaxed),
            timer_pop: self.timer_pop.load(Ordering::Relaxed),
            sysc_migr: self.sysc_migr.load(Ordering::Relaxed),
            setaffinity: self.setaffinity.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            guests: self.guests.load(Ordering::Relaxed),
            givebacks: self.givebacks.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CpuStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub max_compute_level: u32,
    pub max_util_level: u32,
    pub max_running: u32,
    pub guest_dispatch: u64,
    pub timer_pop: u64,
    pub sysc_migr: u64,
    pub setaffinity: u64,
    pub pushed: u64,
    pub guests: u64,
    pub givebacks: u64,
}

impl StatsSnapshot {
    /// Folds `other` in: peaks take the maximum, counters are summed.
    pub fn accumulate(&mut self, other: &Self) {
        self.max_compute_level = self.max_compute_level.max(other.max_compute_level);
        self.max_util_level = self.max_util_level.max(other.max_util_level);
        self.max_running = self.max_running.max(other.max_running);
        self.guest_dispatch += other.guest_dispatch;
        self.timer_pop += other.timer_pop;
        self.sysc_migr += other.sysc_migr;
        self.setaffinity += other.setaffinity;
        self.pushed += other.pushed;
        self.guests += other.guests;
        self.givebacks += other.givebacks;
    }
}

// ---------------------------------------------------------------------------
// Process summary
// ---------------------------------------------------------------------------

/// Statistics gathered when a process leaves the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    /// The exiting process.
    pub pid: Pid,
    /// Per-CPU values for each reserved CPU of the process.
    pub per_cpu: Vec<(CpuId, StatsSnapshot)>,
    /// Peaks and sums over `per_cpu`.
    pub totals: StatsSnapshot,
    /// Location-group keys still referenced at exit, with their counts.
    pub keys: Vec<(GroupKey, u32)>,
}

impl ProcessSummary {
    /// Builds a summary and its totals from per-CPU snapshots.
    pub fn new(pid: Pid, per_cpu: Vec<(CpuId, StatsSnapshot)>, keys: Vec<(GroupKey, u32)>) -> Self {
        let mut totals = StatsSnapshot::default();
        for (_, s) in &per_cpu {
            totals.accumulate(s);
        }
        Self {
            pid,
            per_cpu,
            totals,
            keys,
        }
    }

    /// Logs the summary at the given verbosity.
    ///
    /// Level 1 reports only when compute work was overcommitted, level 2
    /// always reports and lists the location-group keys, level 3 and above
    /// add one line per CPU.
    pub fn emit(&self, level: u32) {
        if level == 0 || (level == 1 && self.totals.max_compute_level <= 1) {
            return;
        }
        if level > 2 {
            for (cpu, s) in &self.per_cpu {
                Self::emit_line(self.pid, &alloc::format!("cpu {cpu}"), s);
            }
        }
        Self::emit_line(self.pid, "total", &self.totals);
        if level > 1 {
            for (key, refs) in &self.keys {
                kinfo!("lwksched[{}]: location key {} refs {}", self.pid, key, refs);
            }
        }
    }

    fn emit_line(pid: Pid, what: &str, s: &StatsSnapshot) {
        kinfo!(
            "lwksched[{}]: {} compute={} util={} running={} guest_dispatch={} timer_pop={} \
             sysc_migr={} setaffinity={} pushed={}",
            pid,
            what,
            s.max_compute_level,
            s.max_util_level,
            s.max_running,
            s.guest_dispatch,
            s.timer_pop,
            s.sysc_migr,
            s.setaffinity,
            s.pushed,
        );
    }
}
