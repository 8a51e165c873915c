//! Atomic owner slot.
//!
//! An [`OwnerCell`] holds the raw id of whoever currently owns a resource,
//! with zero meaning "unowned". Claims are a single compare-and-swap, so
//! two contenders can never both believe they won.

use super::loom_compat::{AtomicU32, Ordering};

/// A lock-free "who owns this" slot.
pub struct OwnerCell {
    owner: AtomicU32,
}

impl OwnerCell {
    /// Creates an unowned cell.
    pub fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
        }
    }

    /// Returns the current owner, if any.
    pub fn get(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Unconditionally sets (or clears) the owner.
    pub fn set(&self, owner: Option<u32>) {
        self.owner.store(owner.unwrap_or(0), Ordering::Release);
    }

    /// Claims the cell for `id`.
    ///
    /// Succeeds if the cell was unowned or already owned by `id`. On
    /// failure returns the id of the current owner.
    pub fn try_claim(&self, id: u32) -> Result<(), u32> {
        debug_assert_ne!(id, 0, "owner id 0 is reserved for 'unowned'");
        match self
            .owner
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == id => Ok(()),
            Err(current) => Err(current),
        }
    }

    /// Releases the cell if it is owned by `id`. Returns `true` on release.
    pub fn release(&self, id: u32) -> bool {
        self.owner
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for OwnerCell {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OwnerCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("OwnerCell").field(&self.get()).finish()
    }
}
