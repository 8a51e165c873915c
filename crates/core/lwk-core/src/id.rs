//! Type-safe identifiers for scheduler resources.
//!
//! These newtypes prevent accidental mixing of process ids, thread ids,
//! CPU numbers and NUMA node numbers at compile time.

use core::fmt;

/// Process identifier (the thread-group id of an HPC process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a new `Pid`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier.
///
/// Zero is reserved to mean "no thread" wherever a thread id is stored in
/// an atomic owner field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Tid(u32);

impl Tid {
    /// Creates a new `Tid`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pid> for Tid {
    /// The founding thread of a process shares the process id.
    fn from(pid: Pid) -> Self {
        Self(pid.0)
    }
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a new `CpuId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NUMA node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a new `NodeId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_raw_values() {
        assert_eq!(Pid::new(7).as_u32(), 7);
        assert_eq!(Tid::new(8).as_u32(), 8);
        assert_eq!(CpuId::new(9).as_usize(), 9);
        assert_eq!(NodeId::new(1).as_usize(), 1);
    }

    #[test]
    fn founding_thread_shares_pid() {
        assert_eq!(Tid::from(Pid::new(1234)), Tid::new(1234));
    }

    #[test]
    fn display_is_the_bare_number() {
        assert_eq!(format!("{}", CpuId::new(12)), "12");
        assert_eq!(format!("{}", Tid::new(3)), "3");
    }
}
