//! Per-CPU scheduler state.
//!
//! A [`CpuSlot`] exists for every possible CPU. Reserved CPUs use all of
//! it; general-purpose CPUs only use their topology and utility
//! commitment counters, which the placement engine consults when it hands
//! utility threads to the general-purpose scheduler.
//!
//! Lock order inside a slot: `commits` and `rq` are independent and never
//! held together.

use lwk_core::id::{CpuId, Pid, Tid};
use lwk_core::sync::{OwnerCell, SpinLock};
use lwk_core::{ktrace, kwarn};

use crate::commit::{CommitKind, CommitOutcome, CommitScope, Commits, UncommitOutcome};
use crate::idle::IdleState;
use crate::runqueue::RunQueue;
use crate::stats::CpuStats;
use crate::topology::CpuTopology;

/// The run queue of a slot together with the thread it is running.
#[derive(Default)]
pub struct CpuRq {
    /// Ready threads.
    pub queue: RunQueue,
    /// Thread currently on the CPU, if the host told us.
    pub curr: Option<Tid>,
}

/// All scheduler state of one CPU.
pub struct CpuSlot {
    cpu: CpuId,
    topology: CpuTopology,
    commits: SpinLock<Commits>,
    rq: SpinLock<CpuRq>,
    exclusive: OwnerCell,
    idle: IdleState,
    idle_tid: SpinLock<Option<Tid>>,
    stats: CpuStats,
}

impl CpuSlot {
    /// Creates the slot of `cpu` with its resolved topology.
    pub fn new(cpu: CpuId, topology: CpuTopology) -> Self {
        Self {
            cpu,
            topology,
            commits: SpinLock::named("slot.commits", Commits::new()),
            rq: SpinLock::named("slot.rq", CpuRq::default()),
            exclusive: OwnerCell::new(),
            idle: IdleState::new(),
            idle_tid: SpinLock::named("slot.idle_tid", None),
            stats: CpuStats::new(),
        }
    }

    /// CPU number of this slot.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Topology identifiers.
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// `true` while the CPU is in the reserved partition.
    pub fn is_lwk(&self) -> bool {
        self.idle.in_partition()
    }

    /// Idle and ownership state.
    pub fn idle_state(&self) -> &IdleState {
        &self.idle
    }

    /// Process owning the CPU.
    pub fn owner(&self) -> Option<Pid> {
        self.idle.owner()
    }

    /// Statistics counters.
    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    /// Run queue lock.
    pub fn rq(&self) -> &SpinLock<CpuRq> {
        &self.rq
    }

    /// Registered idle task.
    pub fn idle_tid(&self) -> Option<Tid> {
        *self.idle_tid.lock()
    }

    pub(crate) fn set_idle_tid(&self, tid: Option<Tid>) {
        *self.idle_tid.lock() = tid;
    }

    // -----------------------------------------------------------------------
    // Commitments
    // -----------------------------------------------------------------------

    /// Snapshot of the commitment counters.
    pub fn commits(&self) -> Commits {
        *self.commits.lock()
    }

    /// Commitments counted under `scope`.
    pub fn commit_count(&self, scope: CommitScope) -> u32 {
        self.commits.lock().count(scope)
    }

    /// Adds one commitment of `kind` and records the new peak.
    pub fn commit(&self, kind: CommitKind) -> CommitOutcome {
        let outcome = self.commits.lock().commit(kind);
        match outcome {
            CommitOutcome::Committed(level) => {
                match kind {
                    CommitKind::Compute => self.stats.record_compute_level(level),
                    CommitKind::Utility => self.stats.record_util_level(level),
                }
                ktrace!("slot: cpu {} {:?} commit -> {}", self.cpu, kind, level);
            }
            CommitOutcome::Saturated => {
                kwarn!("slot: cpu {} {:?} commitment counter saturated", self.cpu, kind);
            }
        }
        outcome
    }

    /// Removes one commitment of `kind`.
    pub fn uncommit(&self, kind: CommitKind) -> UncommitOutcome {
        let outcome = self.commits.lock().uncommit(kind);
        if outcome == UncommitOutcome::Underflow {
            kwarn!("slot: cpu {} {:?} commitment counter underflow", self.cpu, kind);
        }
        outcome
    }

    /// Clears the commitment counters and the exclusive owner.
    pub fn reset_commits(&self) {
        self.commits.lock().reset();
        self.exclusive.set(None);
    }

    // -----------------------------------------------------------------------
    // Exclusive reservation
    // -----------------------------------------------------------------------

    /// Thread holding the CPU exclusively.
    pub fn exclusive_owner(&self) -> Option<Tid> {
        self.exclusive.get().map(Tid::new)
    }

    /// `true` if the CPU is exclusively held by a thread other than `tid`.
    pub fn excluded_for(&self, tid: Option<Tid>) -> bool {
        match self.exclusive.get() {
            None => false,
            Some(owner) => tid.is_none_or(|t| t.as_u32() != owner),
        }
    }

    /// Atomically claims the CPU for `tid`.
    pub fn claim_exclusive(&self, tid: Tid) -> bool {
        self.exclusive.try_claim(tid.as_u32()).is_ok()
    }

    /// Releases an exclusive claim held by `tid`.
    pub fn release_exclusive(&self, tid: Tid) -> bool {
        self.exclusive.release(tid.as_u32())
    }
}

impl core::fmt::Debug for CpuSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuSlot")
            .field("cpu", &self.cpu)
            .field("lwk", &self.is_lwk())
            .field("commits", &self.commits())
            .field("exclusive", &self.exclusive_owner())
            .finish_non_exhaustive()
    }
}
