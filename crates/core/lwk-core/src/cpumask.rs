//! Fixed-width CPU and NUMA node bitmasks.
//!
//! [`CpuMask`] covers [`MAX_CPUS`] CPUs and [`NodeMask`] covers
//! [`MAX_NUMNODES`] nodes. Both are plain `Copy` values so they can be
//! built on the stack inside short critical sections without touching the
//! allocator.
//!
//! Masks print and parse in the kernel "cpulist" format (`0-3,8,10-11`).

use core::fmt;

use crate::id::{CpuId, NodeId};

/// Maximum number of CPUs a [`CpuMask`] can describe.
pub const MAX_CPUS: usize = 256;

/// Maximum number of NUMA nodes a [`NodeMask`] can describe.
pub const MAX_NUMNODES: usize = 64;

const WORDS: usize = MAX_CPUS / 64;

const _: () = assert!(MAX_CPUS % 64 == 0, "MAX_CPUS must be a multiple of 64");

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// Errors returned when parsing a cpulist string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMaskError {
    /// A list element was not a number or `a-b` range.
    InvalidNumber,
    /// A range was written high-to-low.
    ReversedRange,
    /// A number exceeded the mask width.
    OutOfRange(usize),
}

impl fmt::Display for ParseMaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumber => write!(f, "invalid number in list"),
            Self::ReversedRange => write!(f, "range end is below range start"),
            Self::OutOfRange(n) => write!(f, "{n} exceeds the mask width"),
        }
    }
}

impl core::error::Error for ParseMaskError {}

/// Parses a cpulist string, calling `set` for every listed index.
fn parse_list(s: &str, limit: usize, mut set: impl FnMut(usize)) -> Result<(), ParseMaskError> {
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = match part.split_once('-') {
            Some((a, b)) => (parse_index(a)?, parse_index(b)?),
            None => {
                let n = parse_index(part)?;
                (n, n)
            }
        };
        if hi < lo {
            return Err(ParseMaskError::ReversedRange);
        }
        if hi >= limit {
            return Err(ParseMaskError::OutOfRange(hi));
        }
        (lo..=hi).for_each(&mut set);
    }
    Ok(())
}

fn parse_index(s: &str) -> Result<usize, ParseMaskError> {
    s.trim().parse().map_err(|_| ParseMaskError::InvalidNumber)
}

/// Writes ascending indices in cpulist form, collapsing runs into ranges.
fn write_list(f: &mut fmt::Formatter<'_>, iter: impl Iterator<Item = usize>) -> fmt::Result {
    let mut run: Option<(usize, usize)> = None;
    let mut first = true;
    let mut flush = |f: &mut fmt::Formatter<'_>, (lo, hi): (usize, usize)| -> fmt::Result {
        if !first {
            f.write_str(",")?;
        }
        first = false;
        if lo == hi {
            write!(f, "{lo}")
        } else {
            write!(f, "{lo}-{hi}")
        }
    };
    for i in iter {
        run = match run {
            Some((lo, hi)) if hi + 1 == i => Some((lo, i)),
            Some(r) => {
                flush(f, r)?;
                Some((i, i))
            }
            None => Some((i, i)),
        };
    }
    if let Some(r) = run {
        flush(f, r)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CpuMask
// ---------------------------------------------------------------------------

/// A set of CPUs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    /// Creates an empty mask.
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Creates a mask holding CPUs `0..n`.
    pub fn first_n(n: usize) -> Self {
        let mut mask = Self::new();
        for i in 0..n.min(MAX_CPUS) {
            mask.bits[i / 64] |= 1 << (i % 64);
        }
        mask
    }

    /// Creates a mask holding exactly one CPU.
    pub fn single(cpu: CpuId) -> Self {
        let mut mask = Self::new();
        mask.set(cpu);
        mask
    }

    /// Parses a cpulist string such as `"0-3,8"`.
    pub fn parse(s: &str) -> Result<Self, ParseMaskError> {
        let mut mask = Self::new();
        parse_list(s, MAX_CPUS, |i| mask.bits[i / 64] |= 1 << (i % 64))?;
        Ok(mask)
    }

    /// Adds `cpu` to the mask. CPUs beyond [`MAX_CPUS`] are ignored.
    pub fn set(&mut self, cpu: CpuId) {
        let i = cpu.as_usize();
        debug_assert!(i < MAX_CPUS, "cpu {i} beyond MAX_CPUS");
        if i < MAX_CPUS {
            self.bits[i / 64] |= 1 << (i % 64);
        }
    }

    /// Removes `cpu` from the mask.
    pub fn clear(&mut self, cpu: CpuId) {
        let i = cpu.as_usize();
        if i < MAX_CPUS {
            self.bits[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Returns `true` if `cpu` is in the mask.
    pub fn contains(&self, cpu: CpuId) -> bool {
        let i = cpu.as_usize();
        i < MAX_CPUS && self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    /// Returns `true` if no CPU is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Returns the number of CPUs in the mask.
    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns the lowest-numbered CPU in the mask.
    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    /// Iterates the CPUs in ascending order.
    pub fn iter(&self) -> CpuMaskIter {
        CpuMaskIter {
            bits: self.bits,
            word: 0,
        }
    }

    /// Returns the intersection of two masks.
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a &= b;
        }
        out
    }

    /// Returns the union of two masks.
    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a |= b;
        }
        out
    }

    /// Returns the CPUs of `self` that are not in `other`.
    #[must_use]
    pub fn and_not(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits) {
            *a &= !b;
        }
        out
    }

    /// Returns `true` if the masks share at least one CPU.
    pub fn intersects(&self, other: &Self) -> bool {
        self.bits.iter().zip(other.bits).any(|(a, b)| a & b != 0)
    }

    /// Returns `true` if every CPU of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.bits.iter().zip(other.bits).all(|(a, b)| a & !b == 0)
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, self.iter().map(CpuId::as_usize))
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({self})")
    }
}

/// Ascending iterator over the CPUs of a [`CpuMask`].
pub struct CpuMaskIter {
    bits: [u64; WORDS],
    word: usize,
}

impl Iterator for CpuMaskIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        while self.word < WORDS {
            let w = self.bits[self.word];
            if w != 0 {
                let bit = w.trailing_zeros() as usize;
                self.bits[self.word] &= w - 1;
                #[allow(clippy::cast_possible_truncation)]
                return Some(CpuId::new((self.word * 64 + bit) as u32));
            }
            self.word += 1;
        }
        None
    }
}

// ---------------------------------------------------------------------------
// NodeMask
// ---------------------------------------------------------------------------

/// A set of NUMA nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeMask(u64);

impl NodeMask {
    /// Creates an empty mask.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Creates a mask from its raw bit representation.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bit representation.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Parses a node list string such as `"0,2-3"`.
    pub fn parse(s: &str) -> Result<Self, ParseMaskError> {
        let mut mask = Self::new();
        parse_list(s, MAX_NUMNODES, |i| mask.0 |= 1 << i)?;
        Ok(mask)
    }

    /// Adds `node` to the mask. Nodes beyond [`MAX_NUMNODES`] are ignored.
    pub fn set(&mut self, node: NodeId) {
        if node.as_usize() < MAX_NUMNODES {
            self.0 |= 1 << node.as_usize();
        }
    }

    /// Returns `true` if `node` is in the mask.
    pub fn contains(self, node: NodeId) -> bool {
        node.as_usize() < MAX_NUMNODES && self.0 & (1 << node.as_usize()) != 0
    }

    /// Returns `true` if no node is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the nodes in ascending order.
    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        #[allow(clippy::cast_possible_truncation)]
        (0..MAX_NUMNODES)
            .filter(move |&i| self.0 & (1 << i) != 0)
            .map(|i| NodeId::new(i as u32))
    }
}

impl FromIterator<NodeId> for NodeMask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for node in iter {
            mask.set(node);
        }
        mask
    }
}

impl fmt::Display for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, self.iter().map(NodeId::as_usize))
    }
}

impl fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeMask({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(n: u32) -> CpuId {
        CpuId::new(n)
    }

    // --- CpuMask basics ---

    #[test]
    fn empty_mask_has_no_cpus() {
        let mask = CpuMask::new();
        assert!(mask.is_empty());
        assert_eq!(mask.weight(), 0);
        assert_eq!(mask.first(), None);
    }

    #[test]
    fn set_clear_contains() {
        let mut mask = CpuMask::new();
        mask.set(cpu(3));
        mask.set(cpu(200));
        assert!(mask.contains(cpu(3)));
        assert!(mask.contains(cpu(200)));
        assert!(!mask.contains(cpu(4)));
        mask.clear(cpu(3));
        assert!(!mask.contains(cpu(3)));
        assert_eq!(mask.weight(), 1);
    }

    #[test]
    fn iter_is_ascending_across_words() {
        let mask: CpuMask = [cpu(130), cpu(1), cpu(64), cpu(63)].into_iter().collect();
        let cpus: Vec<_> = mask.iter().map(CpuId::as_u32).collect();
        assert_eq!(cpus, vec![1, 63, 64, 130]);
    }

    #[test]
    fn first_n_covers_prefix() {
        let mask = CpuMask::first_n(70);
        assert_eq!(mask.weight(), 70);
        assert!(mask.contains(cpu(69)));
        assert!(!mask.contains(cpu(70)));
    }

    // --- Set algebra ---

    #[test]
    fn subset_and_intersection() {
        let a = CpuMask::parse("0-7").unwrap();
        let b = CpuMask::parse("2-3").unwrap();
        let c = CpuMask::parse("8-9").unwrap();
        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.and(&b), b);
        assert_eq!(a.and_not(&b).weight(), 6);
        assert_eq!(a.or(&c).weight(), 10);
    }

    // --- cpulist format ---

    #[test]
    fn parse_and_display_round_trip() {
        let mask = CpuMask::parse("0-3, 8,10-11").unwrap();
        assert_eq!(mask.weight(), 7);
        assert_eq!(format!("{mask}"), "0-3,8,10-11");
    }

    #[test]
    fn parse_rejects_bad_lists() {
        assert_eq!(CpuMask::parse("3-1"), Err(ParseMaskError::ReversedRange));
        assert_eq!(CpuMask::parse("x"), Err(ParseMaskError::InvalidNumber));
        assert_eq!(CpuMask::parse("256"), Err(ParseMaskError::OutOfRange(256)));
    }

    // --- NodeMask ---

    #[test]
    fn node_mask_basics() {
        let mut nodes = NodeMask::new();
        assert!(nodes.is_empty());
        nodes.set(NodeId::new(2));
        assert!(nodes.contains(NodeId::new(2)));
        assert!(!nodes.contains(NodeId::new(1)));
        assert_eq!(nodes.bits(), 0b100);
        assert_eq!(format!("{}", NodeMask::parse("0,2-3").unwrap()), "0,2-3");
    }
}
