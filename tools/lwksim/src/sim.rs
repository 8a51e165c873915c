//! Drives one scenario through the scheduler.

use anyhow::{Context, Result};
use lwk_core::cpumask::CpuMask;
use lwk_core::id::{CpuId, Pid, Tid};
use lwk_core::kinfo;
use lwk_sched::hints::PlacementResult;
use lwk_sched::idle::PowerHints;
use lwk_sched::stats::ProcessSummary;
use lwk_sched::thread::{Policy, SchedParams, ThreadRole};
use lwk_sched::{
    CloneKind, EnqueueFlags, LwkScheduler, ResultSlot, SchedClass, ThreadRecord, UniformMachine,
};

use crate::scenario::Scenario;

const LEADER: u32 = 1000;
const GUEST_BASE: u32 = 5000;
const IDLE_BASE: u32 = 9000;

/// Where one thread ended up.
#[derive(Debug, Clone)]
pub struct ThreadRow {
    /// Thread id.
    pub tid: Tid,
    /// Role at the end of the run.
    pub role: ThreadRole,
    /// Current CPU.
    pub cpu: CpuId,
    /// Committed CPU.
    pub home: Option<CpuId>,
    /// Affinity mask.
    pub allowed: CpuMask,
    /// Internal priority.
    pub prio: i32,
    /// Scheduling policy.
    pub policy: Policy,
    /// Outcome reported for its placement request.
    pub result: Option<PlacementResult>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct Report {
    /// Process threads in creation order, founding thread first.
    pub threads: Vec<ThreadRow>,
    /// Foreign threads while the partition was up.
    pub guests: Vec<ThreadRow>,
    /// Guests handed back when the partition was torn down.
    pub given_back: usize,
    /// Statistics of the process.
    pub summary: ProcessSummary,
}

fn row(sched: &LwkScheduler, tid: Tid, result: Option<&ResultSlot>) -> Result<ThreadRow> {
    let t = sched.thread(tid).with_context(|| format!("thread {tid} vanished"))?;
    Ok(ThreadRow {
        tid,
        role: t.role,
        cpu: t.cpu,
        home: t.cpu_home,
        allowed: t.allowed,
        prio: t.sched.prio,
        policy: t.sched.policy,
        result: result.map(ResultSlot::get),
    })
}

/// Runs `scenario`, delivering `ticks` timer ticks to every reserved CPU.
pub fn run(scenario: &Scenario, ticks: u32) -> Result<Report> {
    let m = scenario.machine;
    let machine = UniformMachine::new(m.nodes, m.cores_per_node, m.threads_per_core);
    let sched = LwkScheduler::new(&machine, machine.nr_cpus(), PowerHints::HALT);
    let layout = scenario.layout()?;
    let options = scenario.options()?;
    let lwkcpus = layout.lwkcpus;
    let all = layout.original_allowed;

    sched.activate_cpus(&lwkcpus)?;
    for cpu in lwkcpus.iter() {
        sched.register_idle(cpu, Tid::new(IDLE_BASE + cpu.as_u32()))?;
    }

    // Launch.
    let leader = Tid::new(LEADER);
    let start = layout.util_cpus.first().or_else(|| all.first()).unwrap_or(CpuId::new(0));
    let founder = ThreadRecord::new(leader, scenario.process.name.as_str(), SchedParams::fair(0), start, all);
    sched.register_thread(founder)?;
    sched.on_process_init(leader, layout, options)?;
    let pid = Pid::new(LEADER);
    sched.on_process_start(pid)?;

    let mut created = vec![(leader, None)];
    for (i, entry) in scenario.clones.iter().enumerate() {
        let parent = created[entry.parent].0;
        #[allow(clippy::cast_possible_truncation)]
        let child = Tid::new(LEADER + 1 + i as u32);
        let result = ResultSlot::new();
        let request = entry
            .request()
            .with_context(|| format!("clone {}", i + 1))?
            .report_to(result.clone());
        sched.set_clone_attr(parent, request)?;
        sched.task_fork(parent, child, CloneKind::Thread)?;
        created.push((child, Some(result)));
    }
    for &(tid, _) in &created {
        let cpu = sched.thread(tid).map_or(start, |t| t.cpu);
        sched.enqueue_task(cpu, tid, EnqueueFlags::empty())?;
    }

    let mut guest_tids = Vec::with_capacity(scenario.guests.len());
    for (i, entry) in scenario.guests.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let tid = Tid::new(GUEST_BASE + i as u32);
        let cpu = CpuId::new(entry.cpu);
        let guest = ThreadRecord::new(tid, entry.name.as_str(), SchedParams::fair(entry.nice), cpu, CpuMask::single(cpu));
        sched.register_thread(guest)?;
        sched.enqueue_task(cpu, tid, EnqueueFlags::empty())?;
        guest_tids.push(tid);
    }

    for _ in 0..ticks {
        for cpu in lwkcpus.iter() {
            if let Some(tid) = sched.pick_next_task(cpu)? {
                sched.task_tick(cpu, tid)?;
            }
        }
    }

    let threads = created
        .iter()
        .map(|(tid, result)| row(&sched, *tid, result.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let guests = guest_tids
        .iter()
        .map(|&tid| row(&sched, tid, None))
        .collect::<Result<Vec<_>>>()?;

    // Teardown.
    for &(tid, _) in created.iter().skip(1) {
        sched.on_thread_exit(tid)?;
    }
    let summary = sched.on_process_exit(pid)?;
    sched.on_thread_exit(leader)?;
    sched.deactivate_cpus(&lwkcpus)?;
    let given_back = guest_tids
        .iter()
        .filter_map(|&tid| sched.thread(tid))
        .filter(|t| t.role == ThreadRole::Unassimilated)
        .count();
    kinfo!("lwksim: run complete, {} threads placed", threads.len());

    Ok(Report {
        threads,
        guests,
        given_back,
        summary,
    })
}
