//! Thread records and scheduling roles.
//!
//! A [`ThreadRecord`] is the scheduler's view of one thread: which
//! scheduler owns it, its priority fields, its committed home CPU and the
//! placement hints that apply to it. The role a thread plays on a reserved
//! CPU is a single tagged [`ThreadRole`]; a guest carries the scheduling
//! parameters it had before it was assimilated so they can be restored
//! unchanged.

use alloc::string::String;

use lwk_core::cpumask::{CpuMask, NodeMask};
use lwk_core::id::{CpuId, Pid, Tid};

use crate::commit::CommitKind;
use crate::groups::GroupKey;
use crate::hints::{Behavior, CloneHints, Location};
use crate::runqueue::{FAIR_PRIO_BASE, IDLE_PRIO, RqHandle};

/// Timer ticks per second.
pub const HZ: u32 = 1000;

/// Default round-robin time slice, in ticks.
pub const DEFAULT_TIMESLICE: u32 = 100 * HZ / 1000;

/// Real-time priority given to reserved-partition threads.
pub const LWK_DEFAULT_USER_PRIO: u32 = 50;
/// Internal priority of reserved-partition threads.
pub const LWK_DEFAULT_PRIO: i32 = 99 - LWK_DEFAULT_USER_PRIO as i32;
/// Internal priority of high-priority utility threads.
pub const LWK_HIGH_PRIO: i32 = LWK_DEFAULT_PRIO - 1;
/// Internal priority of low-priority utility threads.
pub const LWK_LOW_PRIO: i32 = LWK_DEFAULT_PRIO + 1;

/// Scheduling class a thread belongs to in the host scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    /// CPU stopper threads.
    Stop,
    /// Deadline class.
    Deadline,
    /// Real-time class.
    RealTime,
    /// Fair (general-purpose) class.
    Fair,
    /// The host's own idle class.
    Idle,
    /// This scheduler.
    Lwk,
}

/// Scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Fair time sharing.
    Normal,
    /// Batch fair time sharing.
    Batch,
    /// Fair, lowest weight.
    Idle,
    /// First-in first-out, no time slicing.
    Fifo,
    /// Round-robin time slicing.
    RoundRobin,
    /// Earliest deadline first.
    Deadline,
}

/// Priority fields of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    /// Owning host class.
    pub class: HostClass,
    /// Policy.
    pub policy: Policy,
    /// Effective priority (lower is more important).
    pub prio: i32,
    /// Priority without boosting.
    pub normal_prio: i32,
    /// Nice-derived priority.
    pub static_prio: i32,
    /// Real-time priority (1..=99, 0 for non-real-time).
    pub rt_priority: u32,
}

impl SchedParams {
    /// Fair-class parameters for a nice value in `-20..=19`.
    pub const fn fair(nice: i32) -> Self {
        let prio = FAIR_PRIO_BASE + 20 + nice;
        Self {
            class: HostClass::Fair,
            policy: Policy::Normal,
            prio,
            normal_prio: prio,
            static_prio: prio,
            rt_priority: 0,
        }
    }

    /// Real-time-class parameters.
    pub const fn realtime(policy: Policy, rt_priority: u32) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let prio = 99 - rt_priority as i32;
        Self {
            class: HostClass::RealTime,
            policy,
            prio,
            normal_prio: prio,
            static_prio: FAIR_PRIO_BASE + 20,
            rt_priority,
        }
    }

    /// Deadline-class parameters.
    pub const fn deadline() -> Self {
        Self {
            class: HostClass::Deadline,
            policy: Policy::Deadline,
            prio: -1,
            normal_prio: -1,
            static_prio: FAIR_PRIO_BASE + 20,
            rt_priority: 0,
        }
    }

    /// Parameters of a per-CPU idle task before assimilation.
    pub const fn idle_task() -> Self {
        Self {
            prio: IDLE_PRIO,
            normal_prio: IDLE_PRIO,
            ..Self::fair(0)
        }
    }

    /// Parameters of a reserved-partition worker.
    pub const fn lwk(round_robin: bool) -> Self {
        Self {
            class: HostClass::Lwk,
            policy: if round_robin {
                Policy::RoundRobin
            } else {
                Policy::Fifo
            },
            prio: LWK_DEFAULT_PRIO,
            normal_prio: LWK_DEFAULT_PRIO,
            static_prio: FAIR_PRIO_BASE + 20,
            rt_priority: LWK_DEFAULT_USER_PRIO,
        }
    }

    /// Parameters given to a thread handed to the general-purpose scheduler.
    ///
    /// High priority maps to nice -20, low priority to nice 19, anything
    /// else to nice -10.
    pub fn general_purpose(behavior: Behavior) -> Self {
        let nice = if behavior.contains(Behavior::HIGH_PRIO) {
            -20
        } else if behavior.contains(Behavior::LOW_PRIO) {
            19
        } else {
            -10
        };
        Self::fair(nice)
    }
}

/// Saved scheduling state of an assimilated guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedSched {
    /// Parameters before assimilation.
    pub params: SchedParams,
    /// Remaining time slice before assimilation.
    pub time_slice: u32,
    /// Full time slice before assimilation.
    pub orig_time_slice: u32,
}

/// What a thread is to this scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Not (or no longer) managed by this scheduler.
    Unassimilated,
    /// Reserved-partition worker.
    Normal,
    /// Utility thread of an HPC process.
    Utility,
    /// The per-CPU idle task.
    Idle,
    /// A foreign thread running on a reserved CPU.
    Guest {
        /// State to restore on hand-back.
        saved: SavedSched,
    },
}

impl ThreadRole {
    /// Commitment counter used by threads of this role, if any.
    pub const fn commit_kind(&self) -> Option<CommitKind> {
        match self {
            Self::Normal => Some(CommitKind::Compute),
            Self::Utility => Some(CommitKind::Utility),
            _ => None,
        }
    }

    /// `true` for every role except [`ThreadRole::Unassimilated`].
    pub const fn is_assimilated(&self) -> bool {
        !matches!(self, Self::Unassimilated)
    }
}

/// Hints that applied to a thread's own placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveHints {
    /// Behavior flags.
    pub behavior: Behavior,
    /// Location flags.
    pub location: Location,
    /// Location-group key.
    pub key: Option<GroupKey>,
    /// Explicit node set.
    pub nodes: NodeMask,
}

/// Scheduler view of one thread.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    /// Thread id.
    pub tid: Tid,
    /// Thread-group id.
    pub tgid: Pid,
    /// HPC process this thread belongs to, if any.
    pub process: Option<Pid>,
    /// Command name.
    pub comm: String,
    /// Priority fields.
    pub sched: SchedParams,
    /// Role on reserved CPUs.
    pub role: ThreadRole,
    /// CPU the thread is on (or will run on next).
    pub cpu: CpuId,
    /// Committed home CPU.
    pub cpu_home: Option<CpuId>,
    /// CPUs the thread may run on.
    pub allowed: CpuMask,
    /// Hints to apply to the next thread this one creates.
    pub clone_hints: CloneHints,
    /// Hints that governed this thread's own placement.
    pub active_hints: ActiveHints,
    /// Remaining ticks of the round-robin slice.
    pub time_slice: u32,
    /// Length of a full round-robin slice.
    pub orig_time_slice: u32,
    /// Run-queue linkage while queued on a reserved CPU.
    pub(crate) rq: Option<(CpuId, RqHandle)>,
}

impl ThreadRecord {
    /// Creates a record for a thread outside any HPC process.
    pub fn new(tid: Tid, comm: impl Into<String>, sched: SchedParams, cpu: CpuId, allowed: CpuMask) -> Self {
        Self {
            tid,
            tgid: Pid::new(tid.as_u32()),
            process: None,
            comm: comm.into(),
            sched,
            role: ThreadRole::Unassimilated,
            cpu,
            cpu_home: None,
            allowed,
            clone_hints: CloneHints::default(),
            active_hints: ActiveHints::default(),
            time_slice: DEFAULT_TIMESLICE,
            orig_time_slice: DEFAULT_TIMESLICE,
            rq: None,
        }
    }

    /// Marks the record as belonging to HPC process `pid`.
    #[must_use]
    pub fn in_process(mut self, pid: Pid) -> Self {
        self.tgid = pid;
        self.process = Some(pid);
        self
    }

    /// `true` for the founding thread of its process.
    pub fn is_process_leader(&self) -> bool {
        self.tid.as_u32() == self.tgid.as_u32()
    }

    /// `true` while the thread sits on a reserved CPU's run queue.
    pub fn is_queued(&self) -> bool {
        self.rq.is_some()
    }

    /// `true` if the thread is currently scheduled by this scheduler.
    pub fn on_lwk_class(&self) -> bool {
        self.sched.class == HostClass::Lwk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_constants_sit_in_the_realtime_range() {
        assert_eq!(LWK_DEFAULT_PRIO, 49);
        assert!(LWK_HIGH_PRIO < LWK_DEFAULT_PRIO);
        assert!(LWK_LOW_PRIO > LWK_DEFAULT_PRIO);
        assert_eq!(DEFAULT_TIMESLICE, 100);
    }

    #[test]
    fn fair_params_follow_nice() {
        assert_eq!(SchedParams::fair(0).prio, 120);
        assert_eq!(SchedParams::fair(-20).prio, 100);
        assert_eq!(SchedParams::fair(19).static_prio, 139);
    }

    #[test]
    fn general_purpose_nice_from_behavior() {
        assert_eq!(SchedParams::general_purpose(Behavior::HIGH_PRIO).prio, 100);
        assert_eq!(SchedParams::general_purpose(Behavior::LOW_PRIO).prio, 139);
        assert_eq!(SchedParams::general_purpose(Behavior::empty()).prio, 110);
    }

    #[test]
    fn lwk_params_choose_policy() {
        assert_eq!(SchedParams::lwk(true).policy, Policy::RoundRobin);
        assert_eq!(SchedParams::lwk(false).policy, Policy::Fifo);
        assert_eq!(SchedParams::lwk(false).class, HostClass::Lwk);
    }

    #[test]
    fn roles_map_to_commit_kinds() {
        assert_eq!(ThreadRole::Normal.commit_kind(), Some(CommitKind::Compute));
        assert_eq!(ThreadRole::Utility.commit_kind(), Some(CommitKind::Utility));
        assert_eq!(ThreadRole::Idle.commit_kind(), None);
        assert!(!ThreadRole::Unassimilated.is_assimilated());
    }

    #[test]
    fn leader_detection() {
        let pid = Pid::new(10);
        let leader = ThreadRecord::new(Tid::new(10), "a.out", SchedParams::fair(0), CpuId::new(0), CpuMask::new())
            .in_process(pid);
        let worker = ThreadRecord::new(Tid::new(11), "a.out", SchedParams::fair(0), CpuId::new(0), CpuMask::new())
            .in_process(pid);
        assert!(leader.is_process_leader());
        assert!(!worker.is_process_leader());
    }
}
