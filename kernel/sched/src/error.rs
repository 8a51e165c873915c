//! Scheduler error type.

use core::fmt;

use lwk_core::id::{CpuId, Pid, Tid};

/// Classic errno values returned to the syscall layer.
pub mod errno {
    /// Operation not permitted.
    pub const EPERM: i32 = 1;
    /// No such process.
    pub const ESRCH: i32 = 3;
    /// Device or resource busy.
    pub const EBUSY: i32 = 16;
    /// File exists.
    pub const EEXIST: i32 = 17;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// No space left on device.
    pub const ENOSPC: i32 = 28;
}

/// Errors reported by the scheduler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// More than one same/different/node-set location class was requested.
    ConflictingLocation,
    /// Exclusive behavior was combined with general-purpose CPU placement.
    ExclusiveOnGeneralCpu,
    /// A location-group key was combined with an explicit node set.
    KeyWithNodeSet,
    /// A node set was requested but the supplied mask is empty.
    EmptyNodeSet,
    /// High and low priority were both requested.
    ConflictingPriority,
    /// Both reserved-CPU and general-purpose-CPU placement were requested.
    ConflictingTarget,
    /// A user node mask is larger than the copy limit.
    NodeMaskTooLarge,
    /// A user node mask names a node beyond the supported range.
    NodeOutOfRange(usize),
    /// The option name is not handled by the scheduler.
    UnknownOption,
    /// The option value could not be parsed or is out of range.
    InvalidOptionValue(&'static str),
    /// No record exists for the thread.
    UnknownThread(Tid),
    /// No record exists for the process.
    UnknownProcess(Pid),
    /// A process with this id is already registered.
    ProcessExists(Pid),
    /// A thread with this id is already registered.
    ThreadExists(Tid),
    /// The CPU number is beyond the configured slot count.
    CpuOutOfRange(CpuId),
    /// The CPU is not part of the reserved partition.
    NotPartitionCpu(CpuId),
    /// A process was given an empty set of reserved CPUs.
    EmptyPartition,
    /// Affinity changes are disabled for the process; carries the errno.
    AffinityDisabled(i32),
    /// No CPU satisfied the placement constraints.
    NoCpuAvailable,
    /// The location-group table has no free slot.
    GroupTableFull,
}

impl SchedError {
    /// Returns the errno reported to user space for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::ConflictingLocation
            | Self::ExclusiveOnGeneralCpu
            | Self::KeyWithNodeSet
            | Self::EmptyNodeSet
            | Self::ConflictingPriority
            | Self::ConflictingTarget
            | Self::NodeMaskTooLarge
            | Self::NodeOutOfRange(_)
            | Self::UnknownOption
            | Self::InvalidOptionValue(_)
            | Self::CpuOutOfRange(_)
            | Self::NotPartitionCpu(_)
            | Self::EmptyPartition => errno::EINVAL,
            Self::UnknownThread(_) | Self::UnknownProcess(_) => errno::ESRCH,
            Self::ProcessExists(_) | Self::ThreadExists(_) => errno::EEXIST,
            Self::AffinityDisabled(e) => e,
            Self::NoCpuAvailable => errno::EBUSY,
            Self::GroupTableFull => errno::ENOSPC,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingLocation => write!(f, "conflicting location requests"),
            Self::ExclusiveOnGeneralCpu => {
                write!(f, "exclusive placement is not allowed on general-purpose CPUs")
            }
            Self::KeyWithNodeSet => write!(f, "location key cannot be combined with a node set"),
            Self::EmptyNodeSet => write!(f, "node set requested with an empty node mask"),
            Self::ConflictingPriority => write!(f, "high and low priority both requested"),
            Self::ConflictingTarget => {
                write!(f, "reserved and general-purpose CPU placement both requested")
            }
            Self::NodeMaskTooLarge => write!(f, "node mask exceeds the copy limit"),
            Self::NodeOutOfRange(n) => write!(f, "node {n} is beyond the supported node count"),
            Self::UnknownOption => write!(f, "unknown scheduler option"),
            Self::InvalidOptionValue(name) => write!(f, "invalid value for option '{name}'"),
            Self::UnknownThread(tid) => write!(f, "unknown thread {tid}"),
            Self::UnknownProcess(pid) => write!(f, "unknown process {pid}"),
            Self::ProcessExists(pid) => write!(f, "process {pid} is already registered"),
            Self::ThreadExists(tid) => write!(f, "thread {tid} is already registered"),
            Self::CpuOutOfRange(cpu) => write!(f, "cpu {cpu} is out of range"),
            Self::NotPartitionCpu(cpu) => write!(f, "cpu {cpu} is not in the reserved partition"),
            Self::EmptyPartition => write!(f, "process has no reserved CPUs"),
            Self::AffinityDisabled(e) => write!(f, "affinity changes disabled (errno {e})"),
            Self::NoCpuAvailable => write!(f, "no CPU satisfies the placement constraints"),
            Self::GroupTableFull => write!(f, "location-group table is full"),
        }
    }
}

impl core::error::Error for SchedError {}
