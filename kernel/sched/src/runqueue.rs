//! Per-CPU priority run queue.
//!
//! A fixed array of priority buckets, each an intrusive doubly-linked list
//! threaded through an index arena, plus a bitmap with one bit per
//! non-empty bucket. Finding the highest-priority ready thread is a
//! `trailing_zeros` over two words.
//!
//! The running thread stays queued while it runs, as in the host
//! scheduler's real-time class: `pick_highest` only peeks. Threads hold an
//! [`RqHandle`] (an arena index) so removal is O(1) without back-pointers.
//!
//! Bucket layout, highest priority first:
//!
//! | index | contents |
//! |---|---|
//! | `0..=98` | real-time priorities 0..=98 |
//! | [`FAIR_INDEX`] | every fair/normal priority |
//! | [`CATCHALL_INDEX`] | deadline and other background threads |
//! | [`IDLE_INDEX`] | the per-CPU idle task |

use alloc::vec::Vec;

use lwk_core::id::Tid;
use lwk_core::{kfatal, kwarn};

/// Number of real-time priority buckets.
pub const RT_BUCKETS: usize = 99;
/// Bucket for all fair/normal priorities.
pub const FAIR_INDEX: usize = RT_BUCKETS;
/// Bucket for deadline and unclassified background threads.
pub const CATCHALL_INDEX: usize = RT_BUCKETS + 1;
/// Bucket reserved for the idle task.
pub const IDLE_INDEX: usize = RT_BUCKETS + 2;
/// Total number of buckets.
pub const NR_BUCKETS: usize = RT_BUCKETS + 3;

/// First fair priority (nice -20).
pub const FAIR_PRIO_BASE: i32 = 100;
/// Last fair priority (nice 19).
pub const FAIR_PRIO_LAST: i32 = 139;
/// Priority of the per-CPU idle task.
pub const IDLE_PRIO: i32 = 140;

const BITMAP_WORDS: usize = NR_BUCKETS.div_ceil(64);

/// Maps an internal priority to its bucket.
pub fn bucket_for_prio(prio: i32) -> usize {
    match prio {
        #[allow(clippy::cast_sign_loss)]
        0..=98 => prio as usize,
        FAIR_PRIO_BASE..=FAIR_PRIO_LAST => FAIR_INDEX,
        IDLE_PRIO => IDLE_INDEX,
        p if p < 0 => CATCHALL_INDEX,
        p => {
            kwarn!("runqueue: unexpected priority {}, using the idle bucket", p);
            IDLE_INDEX
        }
    }
}

/// Arena index of a queued thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RqHandle(u32);

#[derive(Debug, Clone, Copy)]
struct Node {
    tid: Tid,
    bucket: usize,
    round_robin: bool,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: Option<u32>,
    tail: Option<u32>,
    len: u32,
}

impl Bucket {
    const EMPTY: Self = Self {
        head: None,
        tail: None,
        len: 0,
    };
}

/// The ready threads of one CPU.
pub struct RunQueue {
    buckets: [Bucket; NR_BUCKETS],
    bitmap: [u64; BITMAP_WORDS],
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    nr_running: u32,
    rr_nr_running: u32,
    idle: Option<RqHandle>,
}

impl RunQueue {
    /// Creates an empty run queue.
    pub const fn new() -> Self {
        Self {
            buckets: [Bucket::EMPTY; NR_BUCKETS],
            bitmap: [0; BITMAP_WORDS],
            nodes: Vec::new(),
            free: Vec::new(),
            nr_running: 0,
            rr_nr_running: 0,
            idle: None,
        }
    }

    /// Number of queued threads, the idle task included once installed.
    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    /// Number of queued round-robin threads.
    pub fn rr_nr_running(&self) -> u32 {
        self.rr_nr_running
    }

    /// Returns the resident idle task, if installed.
    pub fn idle(&self) -> Option<Tid> {
        self.idle.and_then(|h| self.node(h)).map(|n| n.tid)
    }

    /// Queues `tid` at the head or tail of the bucket for `prio`.
    pub fn enqueue(&mut self, tid: Tid, prio: i32, round_robin: bool, at_head: bool) -> RqHandle {
        let bucket = bucket_for_prio(prio);
        let node = Node {
            tid,
            bucket,
            round_robin,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                i
            }
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let i = self.nodes.len() as u32;
                self.nodes.push(Some(node));
                i
            }
        };
        self.link(idx, bucket, at_head);
        self.nr_running += 1;
        if round_robin {
            self.rr_nr_running += 1;
        }
        RqHandle(idx)
    }

    /// Installs the idle task in the idle bucket. It stays resident until
    /// the queue is reset; [`dequeue`](Self::dequeue) ignores it.
    pub fn install_idle(&mut self, tid: Tid) -> RqHandle {
        if let Some(h) = self.idle {
            return h;
        }
        let h = self.enqueue(tid, IDLE_PRIO, false, false);
        self.idle = Some(h);
        h
    }

    /// Removes a queued thread. The idle task is never removed.
    pub fn dequeue(&mut self, handle: RqHandle) -> Option<Tid> {
        if self.idle == Some(handle) {
            return None;
        }
        self.release(handle)
    }

    /// Evicts the idle task; used when the CPU leaves the partition.
    pub fn remove_idle(&mut self) -> Option<Tid> {
        let handle = self.idle.take()?;
        self.release(handle)
    }

    fn release(&mut self, handle: RqHandle) -> Option<Tid> {
        let node = self.node(handle)?;
        self.unlink(handle.0);
        self.nodes[handle.0 as usize] = None;
        self.free.push(handle.0);
        self.nr_running -= 1;
        if node.round_robin {
            self.rr_nr_running -= 1;
        }
        Some(node.tid)
    }

    /// Moves a queued thread to the head or tail of its bucket.
    pub fn requeue(&mut self, handle: RqHandle, at_head: bool) {
        let Some(node) = self.node(handle) else {
            return;
        };
        self.unlink(handle.0);
        self.link(handle.0, node.bucket, at_head);
    }

    /// Returns the thread at the head of the highest-priority bucket.
    ///
    /// # Panics
    ///
    /// Panics if threads are accounted as running but no bucket is marked
    /// non-empty; that means the bitmap and the lists have diverged.
    pub fn pick_highest(&self) -> Option<Tid> {
        if self.nr_running == 0 {
            return None;
        }
        let Some(bucket) = self.highest_bucket() else {
            kfatal!("runqueue: {} running but bitmap is empty", self.nr_running);
            panic!("run queue bitmap empty with {} threads queued", self.nr_running);
        };
        let head = self.buckets[bucket].head?;
        self.nodes[head as usize].map(|n| n.tid)
    }

    /// Index of the highest-priority non-empty bucket.
    pub fn highest_bucket(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Number of threads in bucket `bucket`.
    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets[bucket].len as usize
    }

    /// Bucket holding `handle`, if it is queued.
    pub fn bucket_of(&self, handle: RqHandle) -> Option<usize> {
        self.node(handle).map(|n| n.bucket)
    }

    /// `true` if `handle` is the only thread in its bucket.
    pub fn is_alone(&self, handle: RqHandle) -> bool {
        self.node(handle)
            .is_some_and(|n| self.buckets[n.bucket].len == 1)
    }

    /// Threads of `bucket` from head to tail.
    pub fn iter_bucket(&self, bucket: usize) -> impl Iterator<Item = Tid> + '_ {
        let mut cursor = self.buckets[bucket].head;
        core::iter::from_fn(move || {
            let node = self.nodes[cursor? as usize]?;
            cursor = node.next;
            Some(node.tid)
        })
    }

    fn node(&self, handle: RqHandle) -> Option<Node> {
        self.nodes.get(handle.0 as usize).copied().flatten()
    }

    fn set_bit(&mut self, bucket: usize) {
        self.bitmap[bucket / 64] |= 1 << (bucket % 64);
    }

    fn clear_bit(&mut self, bucket: usize) {
        self.bitmap[bucket / 64] &= !(1 << (bucket % 64));
    }

    fn link(&mut self, idx: u32, bucket: usize, at_head: bool) {
        let b = self.buckets[bucket];
        let (prev, next) = if at_head { (None, b.head) } else { (b.tail, None) };
        if let Some(n) = self.nodes[idx as usize].as_mut() {
            n.bucket = bucket;
            n.prev = prev;
            n.next = next;
        }
        match prev {
            Some(p) => self.set_next(p, Some(idx)),
            None => self.buckets[bucket].head = Some(idx),
        }
        match next {
            Some(n) => self.set_prev(n, Some(idx)),
            None => self.buckets[bucket].tail = Some(idx),
        }
        self.buckets[bucket].len += 1;
        self.set_bit(bucket);
    }

    fn unlink(&mut self, idx: u32) {
        let Some(node) = self.nodes[idx as usize] else {
            return;
        };
        match node.prev {
            Some(p) => self.set_next(p, node.next),
            None => self.buckets[node.bucket].head = node.next,
        }
        match node.next {
            Some(n) => self.set_prev(n, node.prev),
            None => self.buckets[node.bucket].tail = node.prev,
        }
        self.buckets[node.bucket].len -= 1;
        if self.buckets[node.bucket].len == 0 {
            self.clear_bit(node.bucket);
        }
    }

    fn set_next(&mut self, idx: u32, next: Option<u32>) {
        if let Some(n) = self.nodes[idx as usize].as_mut() {
            n.next = next;
        }
    }

    fn set_prev(&mut self, idx: u32, prev: Option<u32>) {
        if let Some(n) = self.nodes[idx as usize].as_mut() {
            n.prev = prev;
        }
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
