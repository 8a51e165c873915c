//! CPU topology model.
//!
//! Each CPU slot carries a [`CpuTopology`] computed once when the CPU is
//! activated into the reserved partition. Identifiers that cannot be
//! resolved are `None`; the placement engine treats an unknown identifier
//! as never matching, so missing cache or NUMA information degrades
//! placement instead of failing it.
//!
//! Identifiers follow the "first CPU" convention: the core id is the
//! lowest-numbered SMT sibling, and each cache id is the lowest-numbered
//! CPU sharing that cache instance.

use lwk_core::cpumask::CpuMask;
use lwk_core::id::{CpuId, NodeId};
use lwk_core::kwarn;

/// A topology level that can be compared between two CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// Same physical core (SMT siblings).
    Core,
    /// Same L1 cache.
    L1,
    /// Same L2 cache.
    L2,
    /// Same L3 cache.
    L3,
    /// Same NUMA domain.
    Domain,
}

/// Resolved topology identifiers of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    /// NUMA node.
    pub numa: Option<NodeId>,
    /// First SMT sibling of the core.
    pub core: Option<CpuId>,
    /// First CPU sharing the L1 cache.
    pub l1: Option<CpuId>,
    /// First CPU sharing the L2 cache.
    pub l2: Option<CpuId>,
    /// First CPU sharing the L3 cache.
    pub l3: Option<CpuId>,
    /// Position of this CPU among its SMT siblings.
    pub thread_index: Option<u32>,
}

impl CpuTopology {
    /// A CPU about which nothing is known.
    pub const UNKNOWN: Self = Self {
        numa: None,
        core: None,
        l1: None,
        l2: None,
        l3: None,
        thread_index: None,
    };

    /// Resolves the identifiers of `cpu` from `source`.
    pub fn discover(cpu: CpuId, source: &impl TopologySource) -> Self {
        let numa = source.numa_node(cpu);
        let siblings = source.smt_siblings(cpu).filter(|m| m.contains(cpu));
        let core = siblings.and_then(|m| m.first());
        #[allow(clippy::cast_possible_truncation)]
        let thread_index = siblings.map(|m| m.iter().take_while(|&c| c < cpu).count() as u32);

        let cache = |level: u8| {
            let id = source
                .cache_sharing(cpu, level)
                .filter(|m| m.contains(cpu))
                .and_then(|m| m.first());
            if id.is_none() {
                kwarn!("topology: cpu {} has no L{} cache information", cpu, level);
            }
            id
        };

        let topo = Self {
            numa,
            core,
            l1: cache(1),
            l2: cache(2),
            l3: cache(3),
            thread_index,
        };
        if topo.numa.is_none() || topo.core.is_none() {
            kwarn!("topology: cpu {} has unresolved node/core ids", cpu);
        }
        topo
    }

    /// Returns the raw identifier at `level`, if resolved.
    pub fn id(&self, level: Locality) -> Option<u32> {
        match level {
            Locality::Core => self.core.map(CpuId::as_u32),
            Locality::L1 => self.l1.map(CpuId::as_u32),
            Locality::L2 => self.l2.map(CpuId::as_u32),
            Locality::L3 => self.l3.map(CpuId::as_u32),
            Locality::Domain => self.numa.map(NodeId::as_u32),
        }
    }
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

// ---------------------------------------------------------------------------
// Topology sources
// ---------------------------------------------------------------------------

/// Supplies raw topology facts about the machine.
///
/// Every method may return `None` when the platform does not know; the
/// corresponding identifier is then recorded as unknown.
pub trait TopologySource {
    /// NUMA node of `cpu`.
    fn numa_node(&self, cpu: CpuId) -> Option<NodeId>;

    /// CPUs sharing the physical core of `cpu` (including `cpu`).
    fn smt_siblings(&self, cpu: CpuId) -> Option<CpuMask>;

    /// CPUs sharing the `level` cache of `cpu` (including `cpu`).
    fn cache_sharing(&self, cpu: CpuId, level: u8) -> Option<CpuMask>;
}

/// A regular machine: `nodes` x `cores_per_node` x `threads_per_core`.
///
/// CPUs are numbered so SMT siblings are adjacent. L1 and L2 are private
/// to a core; L3 is shared by every core of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformMachine {
    /// Number of NUMA nodes.
    pub nodes: u32,
    /// Physical cores per node.
    pub cores_per_node: u32,
    /// Hardware threads per core.
    pub threads_per_core: u32,
}

impl UniformMachine {
    /// Creates a machine description.
    pub const fn new(nodes: u32, cores_per_node: u32, threads_per_core: u32) -> Self {
        Self {
            nodes,
            cores_per_node,
            threads_per_core,
        }
    }

    /// Total number of CPUs.
    pub const fn nr_cpus(&self) -> u32 {
        self.nodes * self.cores_per_node * self.threads_per_core
    }

    fn cpus_per_node(&self) -> u32 {
        self.cores_per_node * self.threads_per_core
    }

    fn span(start: u32, len: u32) -> CpuMask {
        (start..start + len).map(CpuId::new).collect()
    }

    fn core_span(&self, cpu: CpuId) -> CpuMask {
        let first = cpu.as_u32() - cpu.as_u32() % self.threads_per_core;
        Self::span(first, self.threads_per_core)
    }
}

impl TopologySource for UniformMachine {
    fn numa_node(&self, cpu: CpuId) -> Option<NodeId> {
        (cpu.as_u32() < self.nr_cpus()).then(|| NodeId::new(cpu.as_u32() / self.cpus_per_node()))
    }

    fn smt_siblings(&self, cpu: CpuId) -> Option<CpuMask> {
        (cpu.as_u32() < self.nr_cpus()).then(|| self.core_span(cpu))
    }

    fn cache_sharing(&self, cpu: CpuId, level: u8) -> Option<CpuMask> {
        if cpu.as_u32() >= self.nr_cpus() {
            return None;
        }
        match level {
            1 | 2 => Some(self.core_span(cpu)),
            3 => {
                let per_node = self.cpus_per_node();
                Some(Self::span(cpu.as_u32() / per_node * per_node, per_node))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blind;

    impl TopologySource for Blind {
        fn numa_node(&self, _: CpuId) -> Option<NodeId> {
            None
        }
        fn smt_siblings(&self, _: CpuId) -> Option<CpuMask> {
            None
        }
        fn cache_sharing(&self, _: CpuId, _: u8) -> Option<CpuMask> {
            None
        }
    }

    #[test]
    fn uniform_machine_identifiers() {
        // 2 nodes x 2 cores x 2 threads: cpus 0-3 on node 0, 4-7 on node 1.
        let m = UniformMachine::new(2, 2, 2);
        let t5 = CpuTopology::discover(CpuId::new(5), &m);
        assert_eq!(t5.numa, Some(NodeId::new(1)));
        assert_eq!(t5.core, Some(CpuId::new(4)));
        assert_eq!(t5.thread_index, Some(1));
        assert_eq!(t5.l1, Some(CpuId::new(4)));
        assert_eq!(t5.l2, Some(CpuId::new(4)));
        assert_eq!(t5.l3, Some(CpuId::new(4)));

        let t2 = CpuTopology::discover(CpuId::new(2), &m);
        assert_eq!(t2.core, Some(CpuId::new(2)));
        assert_eq!(t2.thread_index, Some(0));
        assert_eq!(t2.l3, Some(CpuId::new(0)));
    }

    #[test]
    fn missing_information_is_unknown() {
        let topo = CpuTopology::discover(CpuId::new(3), &Blind);
        assert_eq!(topo, CpuTopology::UNKNOWN);
        assert_eq!(topo.id(Locality::L2), None);
    }

    #[test]
    fn id_selects_level() {
        let m = UniformMachine::new(1, 4, 1);
        let topo = CpuTopology::discover(CpuId::new(3), &m);
        assert_eq!(topo.id(Locality::Core), Some(3));
        assert_eq!(topo.id(Locality::L3), Some(0));
        assert_eq!(topo.id(Locality::Domain), Some(0));
    }

    #[test]
    fn cpus_beyond_the_machine_are_unknown() {
        let m = UniformMachine::new(1, 2, 1);
        assert_eq!(CpuTopology::discover(CpuId::new(9), &m), CpuTopology::UNKNOWN);
    }
}
