//! Location-group table.
//!
//! Utility threads created independently can share a [`GroupKey`] so they
//! converge on one topology locality. The first placement under a key
//! stores the winning CPU's topology; later placements reuse it as their
//! reference point instead of the creating thread's own location.
//!
//! The table has a small fixed capacity and lives behind the scheduler's
//! group lock. A placement that misses holds that lock from the lookup
//! through the CPU search to the insert, so two creators presenting the
//! same new key cannot both insert it.

use core::fmt;
use core::num::NonZeroU64;

use planck_noalloc::vec::ArrayVec;

use crate::error::SchedError;
use crate::topology::CpuTopology;

/// Number of distinct keys that may be live at once.
pub const UTIL_GROUP_LIMIT: usize = 4;

/// Opaque non-zero location-group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GroupKey(NonZeroU64);

impl GroupKey {
    /// Wraps a raw key; zero means "no key".
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(k) => Some(Self(k)),
            None => None,
        }
    }

    /// Returns the raw key.
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupEntry {
    key: GroupKey,
    refcount: u32,
    topology: CpuTopology,
}

/// Fixed-capacity map from key to reference count and topology snapshot.
pub struct GroupTable {
    entries: ArrayVec<GroupEntry, UTIL_GROUP_LIMIT>,
}

impl GroupTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    fn position(&self, key: GroupKey) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    /// Takes a reference on `key` and returns its topology, if present.
    pub fn acquire(&mut self, key: GroupKey) -> Option<CpuTopology> {
        let idx = self.position(key)?;
        let entry = &mut self.entries[idx];
        entry.refcount += 1;
        Some(entry.topology)
    }

    /// `true` if a new key can be inserted.
    pub fn has_room(&self) -> bool {
        !self.entries.is_full()
    }

    /// Inserts `key` with one reference.
    pub fn insert(&mut self, key: GroupKey, topology: CpuTopology) -> Result<(), SchedError> {
        debug_assert!(self.position(key).is_none(), "duplicate group key {key}");
        if self.entries.is_full() {
            return Err(SchedError::GroupTableFull);
        }
        self.entries.push(GroupEntry {
            key,
            refcount: 1,
            topology,
        });
        Ok(())
    }

    /// Drops one reference on `key`, removing the entry at zero.
    ///
    /// Returns the remaining count, or `None` if the key is unknown.
    pub fn release(&mut self, key: GroupKey) -> Option<u32> {
        let idx = self.position(key)?;
        let entry = &mut self.entries[idx];
        entry.refcount -= 1;
        let remaining = entry.refcount;
        if remaining == 0 {
            self.entries.remove(idx);
        }
        Some(remaining)
    }

    /// Current reference count of `key`.
    pub fn refcount(&self, key: GroupKey) -> Option<u32> {
        self.position(key).map(|i| self.entries[i].refcount)
    }

    /// Cached topology of `key`.
    pub fn topology(&self, key: GroupKey) -> Option<CpuTopology> {
        self.position(key).map(|i| self.entries[i].topology)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no key is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live keys with their reference counts.
    pub fn keys(&self) -> impl Iterator<Item = (GroupKey, u32)> + '_ {
        self.entries.iter().map(|e| (e.key, e.refcount))
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwk_core::id::CpuId;

    fn key(n: u64) -> GroupKey {
        GroupKey::new(n).unwrap()
    }

    fn topo(l2: u32) -> CpuTopology {
        CpuTopology {
            l2: Some(CpuId::new(l2)),
            ..CpuTopology::UNKNOWN
        }
    }

    #[test]
    fn zero_is_not_a_key() {
        assert!(GroupKey::new(0).is_none());
        assert_eq!(key(0x10).get(), 0x10);
        assert_eq!(format!("{}", key(0x10)), "0x10");
    }

    #[test]
    fn acquire_misses_until_inserted() {
        let mut table = GroupTable::new();
        assert_eq!(table.acquire(key(1)), None);
        table.insert(key(1), topo(4)).unwrap();
        assert_eq!(table.acquire(key(1)), Some(topo(4)));
        assert_eq!(table.refcount(key(1)), Some(2));
    }

    #[test]
    fn release_to_zero_frees_the_slot() {
        let mut table = GroupTable::new();
        table.insert(key(1), topo(0)).unwrap();
        table.acquire(key(1));
        assert_eq!(table.release(key(1)), Some(1));
        assert_eq!(table.release(key(1)), Some(0));
        assert!(table.is_empty());
        assert_eq!(table.release(key(1)), None);
    }

    #[test]
    fn table_has_fixed_capacity() {
        let mut table = GroupTable::new();
        for k in 1..=UTIL_GROUP_LIMIT as u64 {
            table.insert(key(k), topo(0)).unwrap();
        }
        assert!(!table.has_room());
        assert_eq!(table.insert(key(99), topo(0)), Err(SchedError::GroupTableFull));
        table.release(key(2));
        assert!(table.has_room());
        let keys: Vec<_> = table.keys().map(|(k, _)| k.get()).collect();
        assert_eq!(keys, vec![1, 3, 4]);
        table.clear();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn clear_forgets_every_key_and_frees_capacity() {
        let mut table = GroupTable::new();
        for k in 1..=UTIL_GROUP_LIMIT as u64 {
            table.insert(key(k), topo(0)).unwrap();
        }
        table.acquire(key(1));
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.keys().count(), 0);
        assert_eq!(table.refcount(key(1)), None);
        assert_eq!(table.acquire(key(1)), None);
        assert!(table.has_room());
        table.insert(key(7), topo(2)).unwrap();
        assert_eq!(table.topology(key(7)), Some(topo(2)));
    }
}
