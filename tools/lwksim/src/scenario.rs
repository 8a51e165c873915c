//! Scenario files.
//!
//! A scenario describes a uniform machine, the reserved partition, one
//! HPC process with its options, the threads it clones and any foreign
//! threads that show up on reserved CPUs:
//!
//! ```toml
//! [machine]
//! nodes = 2
//! cores_per_node = 4
//! threads_per_core = 2
//!
//! [partition]
//! lwkcpus = "4-15"
//! util_cpus = "0-3"
//!
//! [process.options]
//! util-threads = 1
//! lwksched-stats = 3
//! one-cpu-per-util = true
//!
//! [[clone]]
//! utility = true
//! behavior = ["high-prio"]
//! location = ["same-l3", "lwk-cpu"]
//! key = 0xfeed
//!
//! [[guest]]
//! name = "kworker/5:1"
//! cpu = 5
//! ```

use std::ops::BitOr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use lwk_core::cpumask::{CpuMask, NodeMask};
use lwk_core::id::CpuId;
use lwk_sched::groups::GroupKey;
use lwk_sched::{Behavior, CloneFlags, Location, LwkOptions, PlacementRequest, ProcessLayout};
use serde::Deserialize;

/// A complete scenario.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Machine shape.
    pub machine: Machine,
    /// Reserved partition.
    pub partition: Partition,
    /// The HPC process.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Threads cloned by the process, in order.
    #[serde(default, rename = "clone")]
    pub clones: Vec<CloneConfig>,
    /// Foreign threads that land on reserved CPUs.
    #[serde(default, rename = "guest")]
    pub guests: Vec<GuestConfig>,
}

/// Shape of a uniform machine.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Machine {
    /// NUMA nodes.
    pub nodes: u32,
    /// Cores per node.
    pub cores_per_node: u32,
    /// Hardware threads per core.
    #[serde(default = "one")]
    pub threads_per_core: u32,
}

fn one() -> u32 {
    1
}

/// CPU sets of the partition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Partition {
    /// Reserved CPUs, as a cpulist.
    pub lwkcpus: String,
    /// General-purpose CPUs for utility threads; defaults to every CPU
    /// outside the partition.
    #[serde(default)]
    pub util_cpus: Option<String>,
    /// Placement order of the reserved CPUs; defaults to ascending.
    #[serde(default)]
    pub sequence: Option<Vec<u32>>,
}

/// The HPC process.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Command name of the founding thread.
    #[serde(default = "default_name")]
    pub name: String,
    /// Scheduler options by name.
    #[serde(default)]
    pub options: toml::Table,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            options: toml::Table::new(),
        }
    }
}

fn default_name() -> String {
    "a.out".into()
}

/// One thread clone.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneConfig {
    /// Index of the cloning thread: 0 is the founding thread, `n` the
    /// thread created by the `n`-th clone.
    #[serde(default)]
    pub parent: usize,
    /// Request a utility thread.
    #[serde(default)]
    pub utility: bool,
    /// Behavior flag names (`exclusive`, `high-prio`, ...).
    #[serde(default)]
    pub behavior: Vec<String>,
    /// Location flag names (`same-l3`, `lwk-cpu`, ...).
    #[serde(default)]
    pub location: Vec<String>,
    /// Node list for `use-node-set`.
    #[serde(default)]
    pub nodes: Option<String>,
    /// Location-group key.
    #[serde(default)]
    pub key: Option<u64>,
}

/// A foreign thread.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestConfig {
    /// Command name.
    pub name: String,
    /// CPU it is queued on.
    pub cpu: u32,
    /// Nice value.
    #[serde(default)]
    pub nice: i32,
}

impl Scenario {
    /// Reads a scenario file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a scenario from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        if scenario.machine.nodes == 0 || scenario.machine.cores_per_node == 0 {
            bail!("machine must have at least one node and one core");
        }
        if scenario.machine.threads_per_core == 0 {
            bail!("machine must have at least one thread per core");
        }
        for (i, clone) in scenario.clones.iter().enumerate() {
            if clone.parent > i {
                bail!("clone {} names parent {} which does not exist yet", i + 1, clone.parent);
            }
        }
        Ok(scenario)
    }

    /// Process options with every entry of `[process.options]` applied.
    ///
    /// `true` stands for a flag without a value; `false` leaves the option
    /// unset.
    pub fn options(&self) -> Result<LwkOptions> {
        let mut options = LwkOptions::default();
        for (name, value) in &self.process.options {
            let value = match value {
                toml::Value::Boolean(false) => continue,
                toml::Value::Boolean(true) => None,
                toml::Value::Integer(n) => Some(n.to_string()),
                toml::Value::String(s) => Some(s.clone()),
                other => bail!("option '{name}' has unsupported value {other}"),
            };
            options
                .apply(name, value.as_deref())
                .with_context(|| format!("option '{name}'"))?;
        }
        Ok(options)
    }

    /// Partition layout for the process.
    pub fn layout(&self) -> Result<ProcessLayout> {
        let nr_cpus = self.machine.nr_cpus();
        let all = CpuMask::first_n(nr_cpus as usize);
        let lwkcpus = CpuMask::parse(&self.partition.lwkcpus).context("partition.lwkcpus")?;
        if !lwkcpus.is_subset_of(&all) {
            bail!("partition.lwkcpus {lwkcpus} exceeds the machine's {nr_cpus} CPUs");
        }
        let util_cpus = match &self.partition.util_cpus {
            Some(list) => CpuMask::parse(list).context("partition.util_cpus")?,
            None => all.and_not(&lwkcpus),
        };
        let layout = ProcessLayout::new(lwkcpus, util_cpus, all);
        Ok(match &self.partition.sequence {
            Some(seq) => layout.with_sequence(seq.iter().copied().map(CpuId::new).collect()),
            None => layout,
        })
    }
}

impl Machine {
    /// Total number of CPUs.
    pub fn nr_cpus(&self) -> u32 {
        self.nodes * self.cores_per_node * self.threads_per_core
    }
}

impl CloneConfig {
    /// Placement request for this clone.
    pub fn request(&self) -> Result<PlacementRequest> {
        let mut request = PlacementRequest::new()
            .behavior(parse_flags(&self.behavior, "behavior", Behavior::from_name)?)
            .location(parse_flags(&self.location, "location", Location::from_name)?);
        if self.utility {
            request = request.flags(CloneFlags::UTIL);
        }
        if let Some(nodes) = &self.nodes {
            request = request.nodes(NodeMask::parse(nodes).context("clone nodes")?);
        }
        if let Some(raw) = self.key {
            let key = GroupKey::new(raw).context("location key must be non-zero")?;
            request = request.key(key);
        }
        Ok(request)
    }
}

/// Folds kebab-case flag names (`same-l3`) into a flag set.
fn parse_flags<F>(names: &[String], kind: &str, from_name: impl Fn(&str) -> Option<F>) -> Result<F>
where
    F: Default + BitOr<Output = F>,
{
    names.iter().try_fold(F::default(), |acc, name| {
        let upper = name.trim().replace('-', "_").to_ascii_uppercase();
        match from_name(&upper) {
            Some(flag) => Ok(acc | flag),
            None => bail!("unknown {kind} flag '{name}'"),
        }
    })
}
