//! Placement hints for thread creation.
//!
//! A thread prepares hints for the next thread it creates by submitting a
//! [`PlacementRequest`]. The request is validated up front; conflicting
//! combinations are rejected with a distinct [`SchedError`] before any
//! CPU search happens and without touching the caller's pending hints.
//! Accepted requests become [`CloneHints`], consumed by the next fork and
//! then cleared.
//!
//! The requester may pass a [`ResultSlot`]; it starts as `Requested` for
//! every non-empty field and is updated to `Accepted` or `Rejected` once
//! the new thread has been placed.

use alloc::sync::Arc;

use bitflags::bitflags;
use lwk_core::cpumask::{MAX_NUMNODES, NodeMask};
use lwk_core::sync::SpinLock;

use crate::error::SchedError;
use crate::groups::GroupKey;

bitflags! {
    /// Requested behavior of the new thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Behavior: u32 {
        /// The thread gets a CPU to itself.
        const EXCLUSIVE = 1 << 0;
        /// The thread is CPU intensive.
        const HIGH_CPU = 1 << 1;
        /// Run above every other thread of the process.
        const HIGH_PRIO = 1 << 2;
        /// Run below every other thread of the process.
        const LOW_PRIO = 1 << 3;
        /// The thread does not yield; time-slice it.
        const NON_COOP = 1 << 4;
    }
}

impl Behavior {
    /// `true` if empty or carrying at least one known behavior.
    ///
    /// Only meaningful for values decoded with unknown bits retained, as
    /// [`PlacementRequest::from_raw`] does.
    pub fn is_acceptable(self) -> bool {
        self.is_empty() || self.intersects(Self::all())
    }
}

bitflags! {
    /// Requested location of the new thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Location: u32 {
        /// Share an L1 cache with the reference CPU.
        const SAME_L1 = 1 << 0;
        /// Share an L2 cache with the reference CPU.
        const SAME_L2 = 1 << 1;
        /// Share an L3 cache with the reference CPU.
        const SAME_L3 = 1 << 2;
        /// Avoid the reference CPU's L1 cache.
        const DIFF_L1 = 1 << 3;
        /// Avoid the reference CPU's L2 cache.
        const DIFF_L2 = 1 << 4;
        /// Avoid the reference CPU's L3 cache.
        const DIFF_L3 = 1 << 5;
        /// Stay in the reference CPU's NUMA domain.
        const SAME_DOMAIN = 1 << 6;
        /// Leave the reference CPU's NUMA domain.
        const DIFF_DOMAIN = 1 << 7;
        /// Run on a node of the supplied node set.
        const USE_NODE_SET = 1 << 8;
        /// Run on a reserved CPU.
        const LWK_CPU = 1 << 9;
        /// Run on a general-purpose CPU.
        const FWK_CPU = 1 << 10;
        /// The thread services fabric interrupts.
        const FABRIC_INT = 1 << 11;

        /// Flags of which at most one may be requested.
        const CONFLICTS = Self::SAME_L1.bits() | Self::SAME_L2.bits() | Self::SAME_L3.bits()
            | Self::DIFF_L1.bits() | Self::DIFF_L2.bits() | Self::DIFF_L3.bits()
            | Self::SAME_DOMAIN.bits() | Self::DIFF_DOMAIN.bits()
            | Self::USE_NODE_SET.bits();
    }
}

bitflags! {
    /// Request-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CloneFlags: u32 {
        /// Drop all pending hints.
        const CLEAR = 1 << 0;
        /// The next thread is a utility thread.
        const UTIL = 1 << 1;
    }
}

// ---------------------------------------------------------------------------
// Result reporting
// ---------------------------------------------------------------------------

/// Outcome of one field of a placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Nothing was requested.
    #[default]
    NotRequested,
    /// Requested; the thread has not been placed yet.
    Requested,
    /// Honored.
    Accepted,
    /// Not honored.
    Rejected,
}

impl Outcome {
    fn initial(requested: bool) -> Self {
        if requested {
            Self::Requested
        } else {
            Self::NotRequested
        }
    }

    /// `Accepted` or `Rejected`.
    pub const fn decided(honored: bool) -> Self {
        if honored { Self::Accepted } else { Self::Rejected }
    }
}

/// Per-field placement outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlacementResult {
    /// Behavior flags outcome.
    pub behavior: Outcome,
    /// Location flags outcome.
    pub placement: Outcome,
}

/// Shared slot through which the requester observes the outcome.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot(Arc<SpinLock<PlacementResult>>);

impl ResultSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current outcome.
    pub fn get(&self) -> PlacementResult {
        *self.0.lock()
    }

    pub(crate) fn set(&self, result: PlacementResult) {
        *self.0.lock() = result;
    }
}

// ---------------------------------------------------------------------------
// Requests and validated hints
// ---------------------------------------------------------------------------

/// A placement request as received from the syscall layer.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    /// Request-level flags.
    pub flags: CloneFlags,
    /// Behavior flags.
    pub behavior: Behavior,
    /// Location flags.
    pub location: Location,
    /// Explicit node set.
    pub nodes: NodeMask,
    /// Location-group key.
    pub key: Option<GroupKey>,
    /// Where to report the outcome.
    pub result: Option<ResultSlot>,
}

impl PlacementRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the raw flag words handed over by the syscall layer.
    ///
    /// Unknown behavior bits are retained so the behavior is reported as
    /// rejected; unknown request and location bits are dropped.
    pub fn from_raw(flags: u32, behavior: u32, location: u32) -> Self {
        Self {
            flags: CloneFlags::from_bits_truncate(flags),
            behavior: Behavior::from_bits_retain(behavior),
            location: Location::from_bits_truncate(location),
            ..Self::default()
        }
    }

    /// Sets the behavior flags.
    #[must_use]
    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Sets the location flags.
    #[must_use]
    pub fn location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Sets the request-level flags.
    #[must_use]
    pub fn flags(mut self, flags: CloneFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the explicit node set.
    #[must_use]
    pub fn nodes(mut self, nodes: NodeMask) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the location-group key.
    #[must_use]
    pub fn key(mut self, key: GroupKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Requests outcome reporting through `slot`.
    #[must_use]
    pub fn report_to(mut self, slot: ResultSlot) -> Self {
        self.result = Some(slot);
        self
    }

    /// Validates the request and turns it into pending hints.
    ///
    /// A `CLEAR` request always succeeds and yields empty hints.
    pub fn validate(self) -> Result<CloneHints, SchedError> {
        if self.flags.contains(CloneFlags::CLEAR) {
            return Ok(CloneHints::default());
        }
        let mut location = self.location;
        if (location & Location::CONFLICTS).bits().count_ones() > 1 {
            return Err(SchedError::ConflictingLocation);
        }
        if self.behavior.contains(Behavior::EXCLUSIVE) && location.contains(Location::FWK_CPU) {
            return Err(SchedError::ExclusiveOnGeneralCpu);
        }
        if self.key.is_some() && location.contains(Location::USE_NODE_SET) {
            return Err(SchedError::KeyWithNodeSet);
        }
        if location.contains(Location::USE_NODE_SET) && self.nodes.is_empty() {
            return Err(SchedError::EmptyNodeSet);
        }
        if self.behavior.contains(Behavior::HIGH_PRIO | Behavior::LOW_PRIO) {
            return Err(SchedError::ConflictingPriority);
        }
        if location.contains(Location::FABRIC_INT) {
            location |= Location::FWK_CPU;
        }
        if location.contains(Location::LWK_CPU | Location::FWK_CPU) {
            return Err(SchedError::ConflictingTarget);
        }

        if let Some(slot) = &self.result {
            slot.set(PlacementResult {
                behavior: Outcome::initial(!self.behavior.is_empty()),
                placement: Outcome::initial(!location.is_empty()),
            });
        }
        Ok(CloneHints {
            flags: self.flags,
            behavior: self.behavior,
            location,
            nodes: self.nodes,
            key: self.key,
            result: self.result,
        })
    }
}

/// Validated hints waiting for the next thread creation.
#[derive(Debug, Clone, Default)]
pub struct CloneHints {
    /// Request-level flags.
    pub flags: CloneFlags,
    /// Behavior flags.
    pub behavior: Behavior,
    /// Location flags.
    pub location: Location,
    /// Explicit node set.
    pub nodes: NodeMask,
    /// Location-group key.
    pub key: Option<GroupKey>,
    /// Where to report the outcome.
    pub result: Option<ResultSlot>,
}

impl CloneHints {
    /// Writes the final outcome to the requester, if it asked for one.
    pub fn report(&self, behavior_honored: bool, placement_honored: bool) {
        if let Some(slot) = &self.result {
            slot.set(PlacementResult {
                behavior: if self.behavior.is_empty() {
                    Outcome::NotRequested
                } else {
                    Outcome::decided(behavior_honored)
                },
                placement: if self.location.is_empty() {
                    Outcome::NotRequested
                } else {
                    Outcome::decided(placement_honored)
                },
            });
        }
    }
}

// ---------------------------------------------------------------------------
// User node masks
// ---------------------------------------------------------------------------

/// Largest `maxnode` accepted from user space (one page of bits).
pub const MAX_USER_NODES: usize = 4096 * 8;

/// Builds a [`NodeMask`] from a user-supplied word array.
///
/// `maxnode` counts bits plus one, as in the memory-policy system calls.
/// Bits at or past `maxnode - 1` are ignored. Set bits beyond
/// [`MAX_NUMNODES`] are rejected. Words missing from `words` read as zero.
pub fn node_mask_from_user(words: &[u64], maxnode: usize) -> Result<NodeMask, SchedError> {
    let maxnode = maxnode.saturating_sub(1);
    if maxnode == 0 || words.is_empty() {
        return Ok(NodeMask::new());
    }
    if maxnode > MAX_USER_NODES {
        return Err(SchedError::NodeMaskTooLarge);
    }
    let nlongs = maxnode.div_ceil(64);
    let endmask = if maxnode % 64 == 0 {
        u64::MAX
    } else {
        (1u64 << (maxnode % 64)) - 1
    };
    let word = |k: usize| words.get(k).copied().unwrap_or(0);
    let supported = MAX_NUMNODES.div_ceil(64);

    let (nlongs, endmask) = if nlongs > supported {
        for k in supported..nlongs {
            let t = if k == nlongs - 1 { word(k) & endmask } else { word(k) };
            if t != 0 {
                return Err(SchedError::NodeOutOfRange(k * 64 + t.trailing_zeros() as usize));
            }
        }
        (supported, u64::MAX)
    } else {
        (nlongs, endmask)
    };
    debug_assert_eq!(nlongs, 1);
    Ok(NodeMask::from_bits(word(0) & endmask))
}
