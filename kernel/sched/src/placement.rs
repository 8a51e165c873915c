//! CPU placement engine.
//!
//! Placement walks a process's reserved CPUs in canonical order and picks
//! the least committed CPU that passes three filters: it is not held
//! exclusively by another thread, it matches the requested locality, and
//! it is in the thread's allowed set. Levels are searched from zero
//! upwards, so the first hit is always at the lowest available level.
//!
//! Locality is expressed as a [`MatchClass`] plus a reference identifier
//! taken from some CPU's [`CpuTopology`]. When a class cannot be satisfied
//! the caller relaxes it one rung down the ladder:
//!
//! ```text
//! SameCore  -> SameL1  -> SameL2  -> SameL3  -> SameDomain  -> FirstAvail
//! OtherCore -> OtherL1 -> OtherL2 -> OtherL3 -> OtherDomain -> FirstAvail
//! InNodeMask                                                -> FirstAvail
//! ```
//!
//! Every relaxing loop is bounded by [`RELAX_LIMIT`]; reaching the bound
//! means the ladder itself is broken and is treated as fatal.

use lwk_core::cpumask::{CpuMask, NodeMask};
use lwk_core::id::{CpuId, Tid};
use lwk_core::ktrace;

use crate::commit::{COMMIT_MAX, CommitKind, CommitScope};
use crate::hints::Location;
use crate::process::LwkProcess;
use crate::slot::CpuSlot;
use crate::thread::ThreadRecord;
use crate::topology::{CpuTopology, Locality};

/// Upper bound on relax-and-retry iterations of any placement loop.
pub const RELAX_LIMIT: u32 = 100;

/// Locality a candidate CPU must have relative to a reference CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClass {
    /// Same physical core.
    SameCore,
    /// Same L1 cache.
    SameL1,
    /// Same L2 cache.
    SameL2,
    /// Same L3 cache.
    SameL3,
    /// Same NUMA domain.
    SameDomain,
    /// Different physical core.
    OtherCore,
    /// Different L1 cache.
    OtherL1,
    /// Different L2 cache.
    OtherL2,
    /// Different L3 cache.
    OtherL3,
    /// Different NUMA domain.
    OtherDomain,
    /// NUMA node in an explicit node set.
    InNodeMask,
    /// Any CPU.
    FirstAvail,
}

impl MatchClass {
    /// The next, looser class of the relaxation ladder.
    pub const fn relax(self) -> Self {
        match self {
            Self::SameCore => Self::SameL1,
            Self::SameL1 => Self::SameL2,
            Self::SameL2 => Self::SameL3,
            Self::SameL3 => Self::SameDomain,
            Self::OtherCore => Self::OtherL1,
            Self::OtherL1 => Self::OtherL2,
            Self::OtherL2 => Self::OtherL3,
            Self::OtherL3 => Self::OtherDomain,
            Self::SameDomain | Self::OtherDomain | Self::InNodeMask | Self::FirstAvail => {
                Self::FirstAvail
            }
        }
    }

    /// Topology level the class compares, if any.
    pub const fn locality(self) -> Option<Locality> {
        match self {
            Self::SameCore | Self::OtherCore => Some(Locality::Core),
            Self::SameL1 | Self::OtherL1 => Some(Locality::L1),
            Self::SameL2 | Self::OtherL2 => Some(Locality::L2),
            Self::SameL3 | Self::OtherL3 => Some(Locality::L3),
            Self::SameDomain | Self::OtherDomain => Some(Locality::Domain),
            Self::InNodeMask | Self::FirstAvail => None,
        }
    }

    /// The "same" class at the level of an "other" class; other classes
    /// are returned unchanged.
    pub const fn same_counterpart(self) -> Self {
        match self {
            Self::OtherCore => Self::SameCore,
            Self::OtherL1 => Self::SameL1,
            Self::OtherL2 => Self::SameL2,
            Self::OtherL3 => Self::SameL3,
            Self::OtherDomain => Self::SameDomain,
            other => other,
        }
    }

    /// `true` for the "other" family.
    pub const fn is_other(self) -> bool {
        matches!(
            self,
            Self::OtherCore | Self::OtherL1 | Self::OtherL2 | Self::OtherL3 | Self::OtherDomain
        )
    }

    /// Class requested by the first location flag present in `location`.
    pub fn from_location(location: Location) -> Self {
        const ORDER: [(Location, MatchClass); 9] = [
            (Location::SAME_L1, MatchClass::SameL1),
            (Location::SAME_L2, MatchClass::SameL2),
            (Location::SAME_L3, MatchClass::SameL3),
            (Location::DIFF_L1, MatchClass::OtherL1),
            (Location::DIFF_L2, MatchClass::OtherL2),
            (Location::DIFF_L3, MatchClass::OtherL3),
            (Location::SAME_DOMAIN, MatchClass::SameDomain),
            (Location::DIFF_DOMAIN, MatchClass::OtherDomain),
            (Location::USE_NODE_SET, MatchClass::InNodeMask),
        ];
        ORDER
            .iter()
            .find(|(flag, _)| location.contains(*flag))
            .map_or(Self::FirstAvail, |&(_, class)| class)
    }

    /// Reference identifier of `topology` for this class.
    pub fn reference(self, topology: &CpuTopology) -> Option<u32> {
        self.locality().and_then(|level| topology.id(level))
    }

    /// `true` if a CPU with `candidate` topology satisfies the class.
    ///
    /// An unknown identifier on either side never matches.
    pub fn matches(self, candidate: &CpuTopology, reference: Option<u32>, nodes: NodeMask) -> bool {
        match self {
            Self::FirstAvail => true,
            Self::InNodeMask => candidate.numa.is_some_and(|n| nodes.contains(n)),
            class => {
                let (Some(level), Some(reference)) = (class.locality(), reference) else {
                    return false;
                };
                match candidate.id(level) {
                    Some(id) if class.is_other() => id != reference,
                    Some(id) => id == reference,
                    None => false,
                }
            }
        }
    }
}

/// Direction of the walk over the CPU sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrder {
    /// From the first CPU of the sequence.
    Forward,
    /// From the last CPU of the sequence.
    Reverse,
}

/// Parameters of one candidate search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateQuery {
    /// Highest commitment level accepted.
    pub limit: u32,
    /// Walk direction.
    pub order: SearchOrder,
    /// Locality filter.
    pub class: MatchClass,
    /// Reference identifier for `class`.
    pub reference: Option<u32>,
    /// Node set for [`MatchClass::InNodeMask`].
    pub nodes: NodeMask,
    /// Number of sequence entries to consider; `None` means all.
    pub range: Option<usize>,
    /// Commitments that count.
    pub scope: CommitScope,
    /// Claim the CPU exclusively for this thread.
    pub exclusive: Option<Tid>,
}

impl CandidateQuery {
    /// Any CPU, forward, at most `limit` commitments under `scope`.
    pub const fn first_available(limit: u32, scope: CommitScope) -> Self {
        Self {
            limit,
            order: SearchOrder::Forward,
            class: MatchClass::FirstAvail,
            reference: None,
            nodes: NodeMask::new(),
            range: None,
            scope,
            exclusive: None,
        }
    }
}

/// Placement over the reserved CPUs of one process.
#[derive(Clone, Copy)]
pub struct Placer<'a> {
    pub(crate) slots: &'a [CpuSlot],
    pub(crate) process: &'a LwkProcess,
}

impl<'a> Placer<'a> {
    /// Creates a placer over `slots` for `process`.
    pub fn new(slots: &'a [CpuSlot], process: &'a LwkProcess) -> Self {
        Self { slots, process }
    }

    pub(crate) fn slot(&self, cpu: CpuId) -> Option<&'a CpuSlot> {
        self.slots.get(cpu.as_usize())
    }

    /// Finds the least committed CPU satisfying `query` within `allowed`.
    ///
    /// Returns `None` when no CPU matches the locality at all, or when
    /// every matching CPU is above `query.limit`. An exclusive query that
    /// loses the claim race on a CPU keeps searching.
    pub fn select_candidate(&self, allowed: &CpuMask, query: &CandidateQuery) -> Option<CpuId> {
        let sequence = &self.process.layout().sequence;
        let count = query.range.map_or(sequence.len(), |r| r.min(sequence.len()));
        if count == 0 {
            return None;
        }
        let window = |n: usize| match query.order {
            SearchOrder::Forward => sequence[n],
            SearchOrder::Reverse => sequence[sequence.len() - 1 - n],
        };

        let mut level = 0u32;
        loop {
            let mut matched = false;
            let mut next_level: Option<u32> = None;
            for cpu in (0..count).map(window) {
                let Some(slot) = self.slot(cpu) else {
                    continue;
                };
                if slot.excluded_for(query.exclusive) {
                    continue;
                }
                if !query.class.matches(slot.topology(), query.reference, query.nodes) {
                    continue;
                }
                matched = true;
                if !allowed.contains(cpu) {
                    continue;
                }
                let commits = slot.commit_count(query.scope);
                if commits == level {
                    if let Some(tid) = query.exclusive {
                        if !slot.claim_exclusive(tid) {
                            continue;
                        }
                    }
                    ktrace!(
                        "placement: cpu {} at level {} ({:?}, {:?})",
                        cpu,
                        level,
                        query.class,
                        query.scope
                    );
                    return Some(cpu);
                }
                if commits > level {
                    next_level = Some(next_level.map_or(commits, |l| l.min(commits)));
                }
            }
            if !matched {
                return None;
            }
            match next_level {
                Some(l) if l <= query.limit => level = l,
                _ => return None,
            }
        }
    }

    /// Picks a reserved CPU for a compute worker.
    ///
    /// Prefers a completely uncommitted CPU, then one without compute
    /// commitments, then the least committed CPU up to `limit`.
    pub fn select_compute_cpu(&self, allowed: &CpuMask, limit: u32) -> Option<CpuId> {
        let fresh = CandidateQuery::first_available(0, CommitScope::All);
        if let Some(cpu) = self.select_candidate(allowed, &fresh) {
            return Some(cpu);
        }
        if limit == 0 {
            return None;
        }
        self.select_candidate(allowed, &CandidateQuery::first_available(0, CommitScope::ComputeOnly))
            .or_else(|| {
                self.select_candidate(allowed, &CandidateQuery::first_available(limit, CommitScope::All))
            })
    }

    /// Returns the first CPU of the sequence for the founding thread, if
    /// it is allowed and carries no compute commitment.
    pub fn main_thread_home(&self, thread: &ThreadRecord) -> Option<CpuId> {
        if !thread.is_process_leader() {
            return None;
        }
        let first = self.process.layout().first()?;
        if !thread.allowed.contains(first) {
            return None;
        }
        let slot = self.slot(first)?;
        (slot.commits().get(CommitKind::Compute) == 0).then_some(first)
    }

    /// `true` if at least one reserved CPU has no commitment of any kind.
    pub fn has_uncommitted_cpu(&self) -> bool {
        let all = self.process.layout().lwkcpus;
        self.select_candidate(&all, &CandidateQuery::first_available(0, CommitScope::All))
            .is_some()
    }

    /// Compute placement with no level bound.
    pub fn select_compute_unbounded(&self, allowed: &CpuMask) -> Option<CpuId> {
        self.select_compute_cpu(allowed, COMMIT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LwkOptions;
    use crate::process::ProcessLayout;
    use crate::thread::SchedParams;
    use crate::topology::UniformMachine;
    use lwk_core::id::{NodeId, Pid};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 2 nodes x 2 cores x 2 threads: cpus 0-3 on node 0, 4-7 on node 1.
    fn machine() -> Vec<CpuSlot> {
        let m = UniformMachine::new(2, 2, 2);
        (0..m.nr_cpus())
            .map(|c| {
                let cpu = CpuId::new(c);
                CpuSlot::new(cpu, CpuTopology::discover(cpu, &m))
            })
            .collect()
    }

    fn process(lwk: &str) -> LwkProcess {
        let lwkcpus = CpuMask::parse(lwk).unwrap();
        let util = CpuMask::first_n(8).and_not(&lwkcpus);
        LwkProcess::new(
            Pid::new(100),
            ProcessLayout::new(lwkcpus, util, CpuMask::first_n(8)),
            LwkOptions::default(),
        )
    }

    fn all(p: &LwkProcess) -> CpuMask {
        p.layout().lwkcpus
    }

    // --- Match classes ---

    #[test]
    fn ladder_reaches_first_available() {
        for start in [
            MatchClass::SameCore,
            MatchClass::SameL1,
            MatchClass::OtherCore,
            MatchClass::OtherL2,
            MatchClass::InNodeMask,
        ] {
            let mut class = start;
            let mut steps = 0;
            while class != MatchClass::FirstAvail {
                class = class.relax();
                steps += 1;
                assert!(steps < 10, "{start:?} does not terminate");
            }
        }
        assert_eq!(MatchClass::FirstAvail.relax(), MatchClass::FirstAvail);
    }

    #[test]
    fn ladder_order() {
        assert_eq!(MatchClass::SameL1.relax(), MatchClass::SameL2);
        assert_eq!(MatchClass::SameL3.relax(), MatchClass::SameDomain);
        assert_eq!(MatchClass::OtherL1.relax(), MatchClass::OtherL2);
        assert_eq!(MatchClass::OtherL3.relax(), MatchClass::OtherDomain);
        assert_eq!(MatchClass::OtherDomain.relax(), MatchClass::FirstAvail);
    }

    #[test]
    fn unknown_identifiers_never_match() {
        let known = CpuTopology {
            l2: Some(CpuId::new(4)),
            ..CpuTopology::UNKNOWN
        };
        assert!(MatchClass::SameL2.matches(&known, Some(4), NodeMask::new()));
        assert!(!MatchClass::SameL2.matches(&known, None, NodeMask::new()));
        assert!(!MatchClass::OtherL2.matches(&known, None, NodeMask::new()));
        assert!(!MatchClass::OtherL3.matches(&known, Some(0), NodeMask::new()));
        assert!(MatchClass::FirstAvail.matches(&CpuTopology::UNKNOWN, None, NodeMask::new()));
    }

    #[test]
    fn node_mask_matching() {
        let topo = CpuTopology {
            numa: Some(NodeId::new(1)),
            ..CpuTopology::UNKNOWN
        };
        let nodes = NodeMask::parse("1").unwrap();
        assert!(MatchClass::InNodeMask.matches(&topo, None, nodes));
        assert!(!MatchClass::InNodeMask.matches(&CpuTopology::UNKNOWN, None, nodes));
    }

    #[test]
    fn location_flags_pick_the_first_class() {
        assert_eq!(MatchClass::from_location(Location::empty()), MatchClass::FirstAvail);
        assert_eq!(
            MatchClass::from_location(Location::DIFF_L3 | Location::LWK_CPU),
            MatchClass::OtherL3
        );
        assert_eq!(MatchClass::from_location(Location::USE_NODE_SET), MatchClass::InNodeMask);
        assert_eq!(MatchClass::OtherDomain.same_counterpart(), MatchClass::SameDomain);
    }

    // --- Candidate search ---

    #[test]
    fn lowest_level_wins() {
        let slots = machine();
        let p = process("4-7");
        slots[4].commit(CommitKind::Compute);
        slots[5].commit(CommitKind::Compute);
        let placer = Placer::new(&slots, &p);
        let q = CandidateQuery::first_available(COMMIT_MAX, CommitScope::All);
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(6)));
    }

    #[test]
    fn zero_limit_never_overcommits() {
        let slots = machine();
        let p = process("4");
        slots[4].commit(CommitKind::Compute);
        let placer = Placer::new(&slots, &p);
        assert_eq!(placer.select_compute_cpu(&all(&p), 0), None);
        assert_eq!(placer.select_compute_cpu(&all(&p), 1), Some(CpuId::new(4)));
    }

    #[test]
    fn compute_prefers_cpus_without_compute_work() {
        let slots = machine();
        let p = process("4-5");
        slots[4].commit(CommitKind::Compute);
        slots[5].commit(CommitKind::Utility);
        slots[5].commit(CommitKind::Utility);
        let placer = Placer::new(&slots, &p);
        assert_eq!(placer.select_compute_cpu(&all(&p), COMMIT_MAX), Some(CpuId::new(5)));
    }

    #[test]
    fn search_skips_levels_it_never_sees() {
        let slots = machine();
        let p = process("4");
        for _ in 0..50 {
            slots[4].commit(CommitKind::Utility);
        }
        let placer = Placer::new(&slots, &p);
        let q = CandidateQuery::first_available(49, CommitScope::UtilityOnly);
        assert_eq!(placer.select_candidate(&all(&p), &q), None);
        let q = CandidateQuery::first_available(50, CommitScope::UtilityOnly);
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(4)));
    }

    #[test]
    fn reverse_search_and_range() {
        let slots = machine();
        let p = process("4-7");
        let placer = Placer::new(&slots, &p);
        let mut q = CandidateQuery::first_available(0, CommitScope::All);
        q.order = SearchOrder::Reverse;
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(7)));
        q.range = Some(0);
        assert_eq!(placer.select_candidate(&all(&p), &q), None);
        q.range = Some(2);
        slots[7].commit(CommitKind::Utility);
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(6)));
    }

    #[test]
    fn affinity_filters_candidates() {
        let slots = machine();
        let p = process("4-7");
        let placer = Placer::new(&slots, &p);
        let allowed = CpuMask::single(CpuId::new(6));
        let q = CandidateQuery::first_available(0, CommitScope::All);
        assert_eq!(placer.select_candidate(&allowed, &q), Some(CpuId::new(6)));
    }

    #[test]
    fn locality_relative_to_reference() {
        let slots = machine();
        let p = process("0-7");
        let placer = Placer::new(&slots, &p);
        let mut q = CandidateQuery::first_available(0, CommitScope::All);
        q.class = MatchClass::OtherDomain;
        q.reference = Some(0);
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(4)));
        q.class = MatchClass::SameL1;
        q.reference = Some(2);
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(2)));
        q.class = MatchClass::SameL1;
        q.reference = None;
        assert_eq!(placer.select_candidate(&all(&p), &q), None);
    }

    #[test]
    fn exclusive_cpus_are_skipped_by_others() {
        let slots = machine();
        let p = process("4-5");
        let placer = Placer::new(&slots, &p);
        let mut q = CandidateQuery::first_available(0, CommitScope::All);
        q.exclusive = Some(Tid::new(7));
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(4)));
        let plain = CandidateQuery::first_available(0, CommitScope::All);
        assert_eq!(placer.select_candidate(&all(&p), &plain), Some(CpuId::new(5)));
        // The holder itself still sees its CPU.
        assert_eq!(placer.select_candidate(&all(&p), &q), Some(CpuId::new(4)));
    }

    #[test]
    fn concurrent_exclusive_claims_are_disjoint() {
        for _ in 0..200 {
            let slots = machine();
            let p = process("4");
            let placer = Placer::new(&slots, &p);
            let wins = AtomicU32::new(0);
            std::thread::scope(|s| {
                for t in 0..4u32 {
                    let placer = &placer;
                    let wins = &wins;
                    let p = &p;
                    s.spawn(move || {
                        let mut q = CandidateQuery::first_available(0, CommitScope::All);
                        q.exclusive = Some(Tid::new(1000 + t));
                        if placer.select_candidate(&all(p), &q).is_some() {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });
            assert_eq!(wins.load(Ordering::Relaxed), 1);
        }
    }

    // --- Main-thread home ---

    #[test]
    fn leader_goes_home_while_first_cpu_is_free() {
        let slots = machine();
        let p = process("4-7");
        let placer = Placer::new(&slots, &p);
        let leader = ThreadRecord::new(Tid::new(100), "a.out", SchedParams::lwk(false), CpuId::new(0), all(&p))
            .in_process(Pid::new(100));
        let worker = ThreadRecord::new(Tid::new(101), "a.out", SchedParams::lwk(false), CpuId::new(0), all(&p))
            .in_process(Pid::new(100));
        assert_eq!(placer.main_thread_home(&leader), Some(CpuId::new(4)));
        assert_eq!(placer.main_thread_home(&worker), None);
        slots[4].commit(CommitKind::Compute);
        assert_eq!(placer.main_thread_home(&leader), None);
    }
}
