//! Utility-thread placement.
//!
//! Utility threads may run on the process's reserved CPUs (taken from the
//! end of the sequence so compute workers keep the front) or on the
//! general-purpose CPUs the process was given. The search honors the
//! requested locality for as long as it can and relaxes it otherwise;
//! whether the request was honored is reported back to the requester.
//!
//! A location-group key that is already in the group table supplies the
//! reference topology. A key that is not holds the group lock from the
//! lookup until the winning CPU's topology has been stored, so a second
//! creator presenting the same key waits and then finds the entry.

use lwk_core::cpumask::{CpuMask, NodeMask};
use lwk_core::id::{CpuId, Tid};
use lwk_core::sync::SpinLock;
use lwk_core::{kdebug, kfatal, kwarn};

use crate::commit::{COMMIT_MAX, CommitScope};
use crate::groups::{GroupKey, GroupTable};
use crate::hints::{Behavior, CloneHints, Location};
use crate::options::UtilCpuPolicy;
use crate::placement::{CandidateQuery, MatchClass, Placer, RELAX_LIMIT, SearchOrder};
use crate::topology::CpuTopology;

/// Where a utility thread ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilityTarget {
    /// A single reserved CPU; the thread stays with this scheduler.
    Reserved(CpuId),
    /// One or more general-purpose CPUs; the thread is handed over.
    General(CpuMask),
}

impl UtilityTarget {
    /// CPUs the thread may run on.
    pub fn allowed(&self) -> CpuMask {
        match *self {
            Self::Reserved(cpu) => CpuMask::single(cpu),
            Self::General(mask) => mask,
        }
    }

    /// CPU the thread's commitment is recorded against.
    pub fn home(&self) -> Option<CpuId> {
        match self {
            Self::Reserved(cpu) => Some(*cpu),
            Self::General(mask) => mask.first(),
        }
    }

    /// `true` for general-purpose placements.
    pub fn is_general(&self) -> bool {
        matches!(self, Self::General(_))
    }
}

/// Result of a successful utility placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtilityPlacement {
    /// Chosen CPUs.
    pub target: UtilityTarget,
    /// The requested location was satisfied without relaxation.
    pub placement_honored: bool,
    /// Group key the thread now holds a reference on.
    pub key: Option<GroupKey>,
}

/// Where a utility search takes its reference topology from.
enum Reference {
    /// Cached topology of an existing group key.
    Known(CpuTopology),
    /// New key; the first CPU found becomes the reference.
    Pending(GroupKey),
}

impl Placer<'_> {
    /// Picks general-purpose CPUs for a utility thread.
    ///
    /// With [`UtilCpuPolicy::One`] this is the single least committed
    /// matching CPU. Otherwise every matching CPU is taken; after the first
    /// one, "other" classes and pending keys are re-anchored to it so the
    /// whole mask shares one locality. `anchor` requests that re-anchoring
    /// for a pending key and makes the first CPU match unconditionally.
    pub fn select_general_cpus(
        &self,
        mut class: MatchClass,
        mut reference: Option<u32>,
        nodes: NodeMask,
        anchor: bool,
    ) -> CpuMask {
        let util_cpus = self.process.layout().util_cpus;
        let first_class = if anchor { MatchClass::FirstAvail } else { class };

        match self.process.options().util_cpus {
            UtilCpuPolicy::One => {
                let mut level = 0u32;
                loop {
                    let mut matched = false;
                    let mut next_level: Option<u32> = None;
                    for cpu in util_cpus.iter() {
                        let Some(slot) = self.slot(cpu) else {
                            continue;
                        };
                        if !first_class.matches(slot.topology(), reference, nodes) {
                            continue;
                        }
                        matched = true;
                        let commits = slot.commit_count(CommitScope::UtilityOnly);
                        if commits == level {
                            return CpuMask::single(cpu);
                        }
                        if commits > level {
                            next_level = Some(next_level.map_or(commits, |l| l.min(commits)));
                        }
                    }
                    match next_level {
                        Some(l) if matched && l < COMMIT_MAX => level = l,
                        _ => return CpuMask::new(),
                    }
                }
            }
            UtilCpuPolicy::Many => {
                let mut mask = CpuMask::new();
                let mut anchored = false;
                let mut first = anchor;
                for cpu in util_cpus.iter() {
                    let Some(slot) = self.slot(cpu) else {
                        continue;
                    };
                    let current = if first { MatchClass::FirstAvail } else { class };
                    if current.matches(slot.topology(), reference, nodes) {
                        mask.set(cpu);
                        if !anchored {
                            if class.is_other() {
                                class = class.same_counterpart();
                                reference = class.reference(slot.topology());
                            } else if first {
                                reference = class.reference(slot.topology());
                            }
                            anchored = true;
                        }
                    }
                    first = false;
                }
                mask
            }
        }
    }

    /// Places a new utility thread `tid` according to `hints`.
    ///
    /// `home` is the creating thread's committed CPU, used as the
    /// reference when no group key applies. Returns `None` if no CPU could
    /// be found; any group reference taken on the way is dropped again.
    pub fn place_utility(
        &self,
        groups: &SpinLock<GroupTable>,
        tid: Tid,
        allowed: &CpuMask,
        hints: &CloneHints,
        home: Option<CpuId>,
    ) -> Option<UtilityPlacement> {
        let options = self.process.options();
        let location = hints.location;

        let mut pending_table = None;
        let mut held_key = None;
        let reference = match hints.key {
            Some(key) => {
                let mut table = groups.lock();
                match table.acquire(key) {
                    Some(topology) => {
                        held_key = Some(key);
                        Reference::Known(topology)
                    }
                    None => {
                        pending_table = Some(table);
                        Reference::Pending(key)
                    }
                }
            }
            None => {
                let cpu = home.or_else(|| {
                    kwarn!("utility: thread {} has no reserved home, using the first reserved CPU", tid);
                    self.process.layout().lwkcpus.first()
                });
                let topology = cpu
                    .and_then(|c| self.slot(c))
                    .map_or(CpuTopology::UNKNOWN, |s| *s.topology());
                Reference::Known(topology)
            }
        };

        let mut class = MatchClass::from_location(location);
        let (ref_id, pending) = match &reference {
            Reference::Known(topology) => (class.reference(topology), None),
            Reference::Pending(key) => (None, Some(*key)),
        };
        let nodes = hints.nodes;

        let exclusive = hints.behavior.contains(Behavior::EXCLUSIVE).then_some(tid);
        let mut lwk_limit = if exclusive.is_some() {
            Some(0)
        } else if !location.is_empty() {
            Some(COMMIT_MAX)
        } else {
            match options.max_util_threads_per_cpu {
                None => Some(COMMIT_MAX),
                Some(n) => n.checked_sub(1),
            }
        };
        let scope = if exclusive.is_some() {
            CommitScope::All
        } else {
            options.overcommit
        };

        let mut placement_honored = true;
        let mut attempts = 0;
        let target = loop {
            attempts += 1;
            if attempts > RELAX_LIMIT {
                kfatal!("utility: placement of thread {} did not converge", tid);
                panic!("utility placement exceeded {RELAX_LIMIT} relaxations");
            }

            if !location.contains(Location::FWK_CPU) {
                if let Some(limit) = lwk_limit {
                    let query = CandidateQuery {
                        limit,
                        order: SearchOrder::Reverse,
                        class: if pending.is_some() { MatchClass::FirstAvail } else { class },
                        reference: ref_id,
                        nodes,
                        range: options.max_cpus_for_util,
                        scope,
                        exclusive,
                    };
                    if let Some(cpu) = self.select_candidate(allowed, &query) {
                        break Some(UtilityTarget::Reserved(cpu));
                    }
                }
            }
            if !location.contains(Location::LWK_CPU) {
                let mask = self.select_general_cpus(class, ref_id, nodes, pending.is_some());
                if !mask.is_empty() {
                    break Some(UtilityTarget::General(mask));
                }
            }
            if class == MatchClass::FirstAvail {
                if !location.contains(Location::LWK_CPU) || lwk_limit == Some(COMMIT_MAX) {
                    break None;
                }
                if exclusive.is_some() {
                    placement_honored = false;
                }
                lwk_limit = Some(lwk_limit.map_or(0, |l| l + 1));
            } else {
                class = class.relax();
                placement_honored = false;
            }
        };

        let Some(target) = target else {
            drop(pending_table);
            if let Some(key) = held_key {
                groups.lock().release(key);
            }
            kwarn!("utility: no CPU found for thread {}", tid);
            return None;
        };

        if let (Some(mut table), Some(key)) = (pending_table, pending) {
            let topology = target
                .home()
                .and_then(|c| self.slot(c))
                .map_or(CpuTopology::UNKNOWN, |s| *s.topology());
            match table.insert(key, topology) {
                Ok(()) => held_key = Some(key),
                Err(e) => {
                    placement_honored = false;
                    kwarn!("utility: cannot record location key {}: {}", key, e);
                }
            }
        }

        kdebug!(
            "utility: thread {} -> {:?} (honored: {})",
            tid,
            target,
            placement_honored
        );
        Some(UtilityPlacement {
            target,
            placement_honored,
            key: held_key,
        })
    }

    /// Finds general-purpose CPUs for a movable utility thread being
    /// pushed off the partition.
    ///
    /// Starts from the thread's node set, if it had one, and relaxes to
    /// any CPU. Returns the mask and whether the node set was honored.
    pub fn select_push_target(&self, nodes: Option<NodeMask>) -> Option<(CpuMask, bool)> {
        let mut class = if nodes.is_some() {
            MatchClass::InNodeMask
        } else {
            MatchClass::FirstAvail
        };
        let nodes = nodes.unwrap_or_default();
        let mut honored = true;
        for _ in 0..RELAX_LIMIT {
            let mask = self.select_general_cpus(class, None, nodes, false);
            if !mask.is_empty() {
                return Some((mask, honored));
            }
            if class == MatchClass::FirstAvail {
                return None;
            }
            class = class.relax();
            honored = false;
        }
        kfatal!("utility: push target search did not converge");
        panic!("push target search exceeded {RELAX_LIMIT} relaxations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitKind;
    use crate::hints::PlacementRequest;
    use crate::options::LwkOptions;
    use crate::process::{LwkProcess, ProcessLayout};
    use crate::slot::CpuSlot;
    use crate::topology::UniformMachine;
    use lwk_core::id::Pid;

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

    fn process(lwk: &str, util: &str, options: LwkOptions) -> LwkProcess {
        LwkProcess::new(
            Pid::new(100),
            ProcessLayout::new(
                CpuMask::parse(lwk).unwrap(),
                CpuMask::parse(util).unwrap(),
                CpuMask::first_n(8),
            ),
            options,
        )
    }

    fn hints(req: PlacementRequest) -> CloneHints {
        req.validate().unwrap()
    }

    fn key(k: u64) -> GroupKey {
        GroupKey::new(k).unwrap()
    }

    // --- General-purpose CPU selection ---

    #[test]
    fn one_cpu_policy_takes_least_committed() {
        let slots = machine();
        let options = LwkOptions {
            util_cpus: UtilCpuPolicy::One,
            ..LwkOptions::default()
        };
        let p = process("4-7", "0-3", options);
        slots[0].commit(CommitKind::Utility);
        slots[1].commit(CommitKind::Utility);
        let placer = Placer::new(&slots, &p);
        let mask = placer.select_general_cpus(MatchClass::FirstAvail, None, NodeMask::new(), false);
        assert_eq!(mask, CpuMask::single(CpuId::new(2)));
    }

    #[test]
    fn many_policy_anchors_other_classes() {
        let slots = machine();
        let p = process("0-1", "2-7", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        // Different domain than node 0: the first hit (cpu 4) anchors the
        // rest to node 1.
        let mask = placer.select_general_cpus(MatchClass::OtherDomain, Some(0), NodeMask::new(), false);
        assert_eq!(mask, CpuMask::parse("4-7").unwrap());
    }

    #[test]
    fn many_policy_anchors_pending_keys() {
        let slots = machine();
        let p = process("6-7", "2-5", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let mask = placer.select_general_cpus(MatchClass::SameL2, None, NodeMask::new(), true);
        assert_eq!(mask, CpuMask::parse("2-3").unwrap());
    }

    // --- Utility placement ---

    #[test]
    fn utility_threads_fill_from_the_end() {
        let slots = machine();
        let p = process("4-7", "0-3", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        let lwk = p.layout().lwkcpus;
        let placed = placer
            .place_utility(&groups, Tid::new(1), &lwk, &CloneHints::default(), Some(CpuId::new(4)))
            .unwrap();
        assert_eq!(placed.target, UtilityTarget::Reserved(CpuId::new(7)));
        assert!(placed.placement_honored);
    }

    #[test]
    fn threshold_overflows_to_general_cpus() {
        let slots = machine();
        let p = process("4-7", "0-3", LwkOptions::default());
        for cpu in 4..8 {
            slots[cpu].commit(CommitKind::Utility);
        }
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        let lwk = p.layout().lwkcpus;
        let placed = placer
            .place_utility(&groups, Tid::new(1), &lwk, &CloneHints::default(), Some(CpuId::new(4)))
            .unwrap();
        assert_eq!(placed.target, UtilityTarget::General(CpuMask::parse("0-3").unwrap()));
    }

    #[test]
    fn relaxed_location_is_reported() {
        let slots = machine();
        let p = process("4-7", "", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        let lwk = p.layout().lwkcpus;
        // Nothing in node 0 is available to this process.
        let h = hints(PlacementRequest::new().location(Location::SAME_DOMAIN | Location::LWK_CPU));
        let placed = placer
            .place_utility(&groups, Tid::new(1), &lwk, &h, Some(CpuId::new(0)))
            .unwrap();
        assert!(matches!(placed.target, UtilityTarget::Reserved(_)));
        assert!(!placed.placement_honored);
    }

    #[test]
    fn exclusive_claims_the_cpu() {
        let slots = machine();
        let p = process("4-7", "0-3", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        let lwk = p.layout().lwkcpus;
        let h = hints(PlacementRequest::new().behavior(Behavior::EXCLUSIVE).location(Location::LWK_CPU));
        let placed = placer
            .place_utility(&groups, Tid::new(9), &lwk, &h, Some(CpuId::new(4)))
            .unwrap();
        assert_eq!(placed.target, UtilityTarget::Reserved(CpuId::new(7)));
        assert_eq!(slots[7].exclusive_owner(), Some(Tid::new(9)));
    }

    #[test]
    fn new_key_records_winning_topology() {
        let slots = machine();
        let p = process("6-7", "0-5", LwkOptions::default());
        for cpu in 6..8 {
            slots[cpu].commit(CommitKind::Utility);
        }
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        let lwk = p.layout().lwkcpus;
        let h = hints(PlacementRequest::new().key(key(0x42)));
        let placed = placer
            .place_utility(&groups, Tid::new(1), &lwk, &h, None)
            .unwrap();
        assert_eq!(placed.key, Some(key(0x42)));
        let home = placed.target.home().unwrap();
        assert_eq!(groups.lock().topology(key(0x42)), Some(*slots[home.as_usize()].topology()));
        assert_eq!(groups.lock().refcount(key(0x42)), Some(1));
    }

    #[test]
    fn full_group_table_rejects_placement() {
        let slots = machine();
        let p = process("4-7", "0-3", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let groups = SpinLock::new(GroupTable::new());
        for k in 1..=crate::groups::UTIL_GROUP_LIMIT as u64 {
            groups.lock().insert(key(k), CpuTopology::UNKNOWN).unwrap();
        }
        let lwk = p.layout().lwkcpus;
        let h = hints(PlacementRequest::new().key(key(0x99)));
        let placed = placer
            .place_utility(&groups, Tid::new(1), &lwk, &h, Some(CpuId::new(4)))
            .unwrap();
        assert!(!placed.placement_honored);
        assert_eq!(placed.key, None);
    }

    #[test]
    fn push_target_relaxes_node_sets() {
        let slots = machine();
        let p = process("4-7", "0-3", LwkOptions::default());
        let placer = Placer::new(&slots, &p);
        let (mask, honored) = placer
            .select_push_target(Some(NodeMask::parse("1").unwrap()))
            .unwrap();
        assert_eq!(mask, CpuMask::parse("0-3").unwrap());
        assert!(!honored);
        let (mask, honored) = placer
            .select_push_target(Some(NodeMask::parse("0").unwrap()))
            .unwrap();
        assert_eq!(mask, CpuMask::parse("0-3").unwrap());
        assert!(honored);
    }
}
