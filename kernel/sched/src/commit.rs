//! Commitment ledger counters.
//!
//! Every CPU slot counts how many compute and utility threads have been
//! given that CPU as their home. The placement engine reads these counts
//! to balance new threads; commit and uncommit are the only writers and
//! always come in pairs.
//!
//! Counters saturate at [`COMMIT_MAX`] and refuse to go below zero. Both
//! conditions are reported to the caller, which logs them; the counter
//! itself is left untouched.

/// Saturation point of a commitment counter and the "no limit" search level.
pub const COMMIT_MAX: u32 = i32::MAX as u32;

/// Which counter a thread's commitment lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// Reserved-partition worker threads.
    Compute,
    /// Utility threads.
    Utility,
}

/// Which commitments count when comparing CPUs for placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitScope {
    /// Compute and utility commitments.
    All,
    /// Compute commitments only.
    ComputeOnly,
    /// Utility commitments only.
    #[default]
    UtilityOnly,
}

impl CommitScope {
    /// Decodes the numeric `overcommit-behavior` option value.
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::All),
            1 => Some(Self::ComputeOnly),
            2 => Some(Self::UtilityOnly),
            _ => None,
        }
    }
}

/// Result of [`Commits::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The counter was incremented to the contained value.
    Committed(u32),
    /// The counter was already at [`COMMIT_MAX`]; nothing changed.
    Saturated,
}

/// Result of [`Commits::uncommit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncommitOutcome {
    /// The counter was decremented to the contained value.
    Released(u32),
    /// The counter was already zero; nothing changed.
    Underflow,
}

/// Per-CPU commitment counters. Protected by the slot's commit lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Commits {
    compute: u32,
    utility: u32,
}

impl Commits {
    /// Creates zeroed counters.
    pub const fn new() -> Self {
        Self {
            compute: 0,
            utility: 0,
        }
    }

    /// Returns the counter for `kind`.
    pub const fn get(&self, kind: CommitKind) -> u32 {
        match kind {
            CommitKind::Compute => self.compute,
            CommitKind::Utility => self.utility,
        }
    }

    /// Returns the commitments that count under `scope`.
    pub const fn count(&self, scope: CommitScope) -> u32 {
        match scope {
            CommitScope::All => self.compute.saturating_add(self.utility),
            CommitScope::ComputeOnly => self.compute,
            CommitScope::UtilityOnly => self.utility,
        }
    }

    /// Sum of both counters.
    pub const fn total(&self) -> u32 {
        self.count(CommitScope::All)
    }

    /// More than one thread calls this CPU home.
    pub const fn is_overcommitted(&self) -> bool {
        self.total() > 1
    }

    /// Adds one commitment of `kind`.
    pub fn commit(&mut self, kind: CommitKind) -> CommitOutcome {
        let counter = self.counter_mut(kind);
        if *counter >= COMMIT_MAX {
            return CommitOutcome::Saturated;
        }
        *counter += 1;
        CommitOutcome::Committed(*counter)
    }

    /// Removes one commitment of `kind`.
    pub fn uncommit(&mut self, kind: CommitKind) -> UncommitOutcome {
        let counter = self.counter_mut(kind);
        if *counter == 0 {
            return UncommitOutcome::Underflow;
        }
        *counter -= 1;
        UncommitOutcome::Released(*counter)
    }

    /// Clears both counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn counter_mut(&mut self, kind: CommitKind) -> &mut u32 {
        match kind {
            CommitKind::Compute => &mut self.compute,
            CommitKind::Utility => &mut self.utility,
        }
    }

    #[cfg(test)]
    pub(crate) fn with(compute: u32, utility: u32) -> Self {
        Self { compute, utility }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_uncommit_restores_state() {
        let mut c = Commits::with(2, 1);
        let before = c;
        assert_eq!(c.commit(CommitKind::Compute), CommitOutcome::Committed(3));
        assert_eq!(c.uncommit(CommitKind::Compute), UncommitOutcome::Released(2));
        assert_eq!(c, before);
    }

    #[test]
    fn underflow_is_a_no_op() {
        let mut c = Commits::new();
        assert_eq!(c.uncommit(CommitKind::Utility), UncommitOutcome::Underflow);
        assert_eq!(c, Commits::new());
    }

    #[test]
    fn overflow_saturates() {
        let mut c = Commits::with(COMMIT_MAX, 0);
        assert_eq!(c.commit(CommitKind::Compute), CommitOutcome::Saturated);
        assert_eq!(c.get(CommitKind::Compute), COMMIT_MAX);
    }

    #[test]
    fn scope_selects_counters() {
        let c = Commits::with(1, 2);
        assert_eq!(c.count(CommitScope::All), 3);
        assert_eq!(c.count(CommitScope::ComputeOnly), 1);
        assert_eq!(c.count(CommitScope::UtilityOnly), 2);
        assert!(c.is_overcommitted());
        assert!(!Commits::with(0, 1).is_overcommitted());
    }

    #[test]
    fn all_scope_does_not_wrap() {
        assert_eq!(Commits::with(COMMIT_MAX, COMMIT_MAX).count(CommitScope::All), u32::MAX);
    }

    #[test]
    fn overcommit_behavior_decoding() {
        assert_eq!(CommitScope::from_raw(0), Some(CommitScope::All));
        assert_eq!(CommitScope::from_raw(2), Some(CommitScope::UtilityOnly));
        assert_eq!(CommitScope::from_raw(3), None);
    }
}
