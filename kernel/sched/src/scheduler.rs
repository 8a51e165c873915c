//! The scheduler context.
//!
//! [`LwkScheduler`] owns every piece of scheduler state: one [`CpuSlot`]
//! per possible CPU, the location-group table, the thread table and the
//! registered HPC processes. Every operation of the host-facing interface
//! goes through it; nothing lives in statics.
//!
//! # Lock order
//!
//! 1. `threads` (outer lock of every thread operation)
//! 2. `groups`
//! 3. a process's movable list
//! 4. a slot's `commits` or `rq` (never both)
//!
//! `processes` is a leaf: it is held only long enough to clone an
//! `Arc<LwkProcess>` out of it. The groups lock is always released before
//! the movable list is touched.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lwk_core::cpumask::CpuMask;
use lwk_core::id::{CpuId, Pid, Tid};
use lwk_core::sync::SpinLock;
use lwk_core::{kdebug, kinfo, kwarn};

use crate::assimilate::{self, Assimilation};
use crate::error::SchedError;
use crate::groups::{GroupKey, GroupTable};
use crate::hints::{Behavior, CloneFlags, CloneHints, Location, PlacementRequest};
use crate::idle::{IdleLoop, IdlePlatform, IdleReport, PowerHints};
use crate::options::LwkOptions;
use crate::placement::Placer;
use crate::process::{LwkProcess, ProcessLayout};
use crate::slot::CpuSlot;
use crate::stats::{Counter, ProcessSummary};
use crate::thread::{
    ActiveHints, LWK_HIGH_PRIO, LWK_LOW_PRIO, Policy, SchedParams, ThreadRecord, ThreadRole,
};
use crate::topology::{CpuTopology, TopologySource};
use crate::utility::UtilityTarget;

pub(crate) type ThreadTable = BTreeMap<Tid, ThreadRecord>;

/// What a fork creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneKind {
    /// A thread sharing the parent's process.
    Thread,
    /// A new process.
    Process,
}

/// Commitment-aware scheduler for a reserved CPU partition.
pub struct LwkScheduler {
    pub(crate) slots: Vec<CpuSlot>,
    pub(crate) groups: SpinLock<GroupTable>,
    pub(crate) threads: SpinLock<ThreadTable>,
    processes: SpinLock<BTreeMap<Pid, Arc<LwkProcess>>>,
    power: PowerHints,
}

impl LwkScheduler {
    /// Creates a scheduler for `nr_cpus` CPUs, resolving each CPU's
    /// topology from `source` once.
    pub fn new(source: &impl TopologySource, nr_cpus: u32, power: PowerHints) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let nr_cpus = nr_cpus.min(lwk_core::cpumask::MAX_CPUS as u32);
        let slots = (0..nr_cpus)
            .map(CpuId::new)
            .map(|cpu| CpuSlot::new(cpu, CpuTopology::discover(cpu, source)))
            .collect();
        Self {
            slots,
            groups: SpinLock::named("sched.groups", GroupTable::new()),
            threads: SpinLock::named("sched.threads", BTreeMap::new()),
            processes: SpinLock::named("sched.processes", BTreeMap::new()),
            power,
        }
    }

    /// All CPU slots, indexed by CPU number.
    pub fn slots(&self) -> &[CpuSlot] {
        &self.slots
    }

    /// Slot of `cpu`.
    pub fn slot(&self, cpu: CpuId) -> Result<&CpuSlot, SchedError> {
        self.slots.get(cpu.as_usize()).ok_or(SchedError::CpuOutOfRange(cpu))
    }

    /// CPUs currently in the reserved partition.
    pub fn lwkcpus(&self) -> CpuMask {
        self.slots
            .iter()
            .filter(|s| s.is_lwk())
            .map(CpuSlot::cpu)
            .collect()
    }

    /// Copy of a thread's record.
    pub fn thread(&self, tid: Tid) -> Option<ThreadRecord> {
        self.threads.lock().get(&tid).cloned()
    }

    /// A registered HPC process.
    pub fn process(&self, pid: Pid) -> Option<Arc<LwkProcess>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Current reference count of a location-group key.
    pub fn group_refcount(&self, key: GroupKey) -> Option<u32> {
        self.groups.lock().refcount(key)
    }

    pub(crate) fn process_of(&self, thread: &ThreadRecord) -> Option<Arc<LwkProcess>> {
        let pid = thread.process?;
        self.processes.lock().get(&pid).cloned()
    }

    fn check_mask(&self, mask: &CpuMask) -> Result<(), SchedError> {
        mask.iter().try_for_each(|cpu| self.slot(cpu).map(|_| ()))
    }

    // -----------------------------------------------------------------------
    // Partition membership
    // -----------------------------------------------------------------------

    /// Adds `cpus` to the reserved partition.
    pub fn activate_cpus(&self, cpus: &CpuMask) -> Result<(), SchedError> {
        self.check_mask(cpus)?;
        for cpu in cpus.iter() {
            self.slot(cpu)?.idle_state().set_in_partition(true);
        }
        kinfo!("sched: cpus {} joined the partition", cpus);
        Ok(())
    }

    /// Returns `cpus` to general-purpose use.
    ///
    /// Idle tasks are evicted and every guest still queued on one of the
    /// CPUs is handed back with its saved scheduling state.
    pub fn deactivate_cpus(&self, cpus: &CpuMask) -> Result<(), SchedError> {
        self.check_mask(cpus)?;
        let mut threads = self.threads.lock();
        for cpu in cpus.iter() {
            let slot = self.slot(cpu)?;
            slot.idle_state().set_in_partition(false);
            slot.idle_state().set_owner(None);

            if let Some(idle) = slot.idle_tid() {
                slot.rq().lock().queue.remove_idle();
                slot.set_idle_tid(None);
                if let Some(t) = threads.get_mut(&idle) {
                    t.rq = None;
                    assimilate::release_idle(t);
                }
            }

            let guests: Vec<Tid> = threads
                .values()
                .filter(|t| matches!(t.role, ThreadRole::Guest { .. }))
                .filter(|t| t.rq.is_some_and(|(c, _)| c == cpu))
                .map(|t| t.tid)
                .collect();
            for tid in guests {
                if let Some(t) = threads.get_mut(&tid) {
                    self.dequeue_record(t);
                    assimilate::assimilate(t, slot, None);
                }
            }
        }
        drop(threads);

        let (guests, givebacks) = self.slots.iter().fold((0, 0), |(g, b), s| {
            let snap = s.stats().snapshot();
            (g + snap.guests, b + snap.givebacks)
        });
        kinfo!("sched: giving back {} of {} assimilated threads", givebacks, guests);
        Ok(())
    }

    /// Registers `tid` as the idle task of reserved CPU `cpu` and installs
    /// it in the CPU's run queue.
    pub fn register_idle(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError> {
        let slot = self.slot(cpu)?;
        if !slot.is_lwk() {
            return Err(SchedError::NotPartitionCpu(cpu));
        }
        slot.set_idle_tid(Some(tid));
        let mut threads = self.threads.lock();
        let t = threads.entry(tid).or_insert_with(|| {
            ThreadRecord::new(
                tid,
                format!("mos_idle/{cpu}"),
                SchedParams::idle_task(),
                cpu,
                CpuMask::single(cpu),
            )
        });
        self.assimilate_record(t, slot);
        Ok(())
    }

    /// Runs the idle task body of `cpu` until the CPU leaves the partition.
    pub fn idle_loop<P: IdlePlatform>(&self, cpu: CpuId, platform: &P) -> Result<IdleReport, SchedError> {
        let slot = self.slot(cpu)?;
        Ok(IdleLoop::new(cpu, slot.idle_state(), self.power, platform).run())
    }

    // -----------------------------------------------------------------------
    // Threads and assimilation
    // -----------------------------------------------------------------------

    /// Starts tracking a thread.
    pub fn register_thread(&self, record: ThreadRecord) -> Result<(), SchedError> {
        self.slot(record.cpu)?;
        let mut threads = self.threads.lock();
        if threads.contains_key(&record.tid) {
            return Err(SchedError::ThreadExists(record.tid));
        }
        threads.insert(record.tid, record);
        Ok(())
    }

    /// Validates `request` and stores it as the hints for the next thread
    /// `tid` creates. Pending hints are untouched if validation fails.
    pub fn set_clone_attr(&self, tid: Tid, request: PlacementRequest) -> Result<(), SchedError> {
        let hints = request.validate()?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        t.clone_hints = hints;
        Ok(())
    }

    /// Runs `tid` through assimilation as it is about to be queued on `cpu`.
    pub fn assimilate(&self, tid: Tid, cpu: CpuId) -> Result<Assimilation, SchedError> {
        let slot = self.slot(cpu)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        Ok(self.assimilate_record(t, slot))
    }

    pub(crate) fn assimilate_record(&self, t: &mut ThreadRecord, slot: &CpuSlot) -> Assimilation {
        let options = self.process_of(t).map(|p| *p.options());
        let outcome = assimilate::assimilate(t, slot, options.as_ref());
        if outcome == Assimilation::Idle {
            let handle = slot.rq().lock().queue.install_idle(t.tid);
            t.rq = Some((slot.cpu(), handle));
        }
        outcome
    }

    /// Counts a system-call migration off `tid`'s CPU.
    ///
    /// Returns `false` when the thread's process disabled migration.
    pub fn syscall_migration(&self, tid: Tid) -> Result<bool, SchedError> {
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        if self
            .process_of(t)
            .is_some_and(|p| p.options().move_syscalls_disable)
        {
            return Ok(false);
        }
        self.slot(t.cpu)?.stats().bump(Counter::SyscallMigration);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Commitments
    // -----------------------------------------------------------------------

    /// Records `cpu` as the home of `t` and counts the commitment under
    /// the thread's role. The home may be a general-purpose CPU.
    pub(crate) fn commit_thread(&self, t: &mut ThreadRecord, cpu: CpuId) {
        let Some(slot) = self.slots.get(cpu.as_usize()) else {
            kwarn!("sched: commit of thread {} to unknown cpu {}", t.tid, cpu);
            return;
        };
        if let Some(kind) = t.role.commit_kind() {
            slot.commit(kind);
        }
        t.cpu_home = Some(cpu);
    }

    /// Releases the home commitment of `t`, if it has one.
    pub(crate) fn uncommit_thread(&self, t: &mut ThreadRecord) {
        let Some(cpu) = t.cpu_home.take() else {
            return;
        };
        if let (Some(kind), Some(slot)) = (t.role.commit_kind(), self.slots.get(cpu.as_usize())) {
            slot.uncommit(kind);
        }
    }

    pub(crate) fn dequeue_record(&self, t: &mut ThreadRecord) {
        if t.role == ThreadRole::Idle {
            return;
        }
        if let Some((cpu, handle)) = t.rq.take() {
            if let Some(slot) = self.slots.get(cpu.as_usize()) {
                slot.rq().lock().queue.dequeue(handle);
            }
        }
    }

    /// Moves `t` to `new_cpu`, transferring its commitment when it lands
    /// on a reserved CPU other than its home.
    pub(crate) fn migrate(&self, t: &mut ThreadRecord, new_cpu: CpuId) {
        let lwk = self.slots.get(new_cpu.as_usize()).is_some_and(CpuSlot::is_lwk);
        if t.cpu != new_cpu && lwk && t.process.is_some() && t.cpu_home != Some(new_cpu) {
            self.uncommit_thread(t);
            self.commit_thread(t, new_cpu);
        }
        t.cpu = new_cpu;
    }

    /// Tells the scheduler `tid` now runs on `new_cpu`.
    ///
    /// The host dequeues the thread before migrating it.
    pub fn set_task_cpu(&self, tid: Tid, new_cpu: CpuId) -> Result<(), SchedError> {
        self.slot(new_cpu)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        self.migrate(t, new_cpu);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Affinity
    // -----------------------------------------------------------------------

    /// Picks the CPU `tid` should move to once its affinity becomes
    /// `new_mask`.
    pub fn select_next_cpu(&self, tid: Tid, new_mask: &CpuMask) -> Result<CpuId, SchedError> {
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        self.next_cpu(t, new_mask)
    }

    fn next_cpu(&self, t: &ThreadRecord, new_mask: &CpuMask) -> Result<CpuId, SchedError> {
        if let Some(process) = self.process_of(t) {
            let placer = Placer::new(&self.slots, &process);
            let mut probe = t.clone();
            probe.allowed = *new_mask;
            if let Some(cpu) = placer.main_thread_home(&probe) {
                return Ok(cpu);
            }
            if new_mask.contains(t.cpu) {
                return Ok(t.cpu);
            }
            if let Some(home) = t.cpu_home.filter(|&c| new_mask.contains(c)) {
                return Ok(home);
            }
            if new_mask.is_subset_of(&process.layout().lwkcpus) {
                if let Some(cpu) = placer.select_compute_unbounded(new_mask) {
                    return Ok(cpu);
                }
            }
        } else if new_mask.contains(t.cpu) {
            return Ok(t.cpu);
        }
        new_mask.first().ok_or(SchedError::NoCpuAvailable)
    }

    /// Changes the affinity of `tid` and moves it to the CPU picked by
    /// [`select_next_cpu`](Self::select_next_cpu).
    ///
    /// Processes launched with affinity changes disabled get their errno
    /// back; errno 0 ignores the request and reports success.
    pub fn set_affinity(&self, tid: Tid, new_mask: &CpuMask) -> Result<CpuId, SchedError> {
        self.check_mask(new_mask)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        if let Some(process) = self.process_of(t) {
            self.slot(t.cpu)?.stats().bump(Counter::SetAffinity);
            match process.options().disable_setaffinity {
                Some(0) => return Ok(t.cpu),
                Some(errno) => return Err(SchedError::AffinityDisabled(errno)),
                None => {}
            }
        }
        let cpu = self.next_cpu(t, new_mask)?;
        t.allowed = *new_mask;
        self.move_thread(t, cpu);
        Ok(cpu)
    }

    /// Migrates `t` to `cpu`, carrying its run-queue membership along.
    fn move_thread(&self, t: &mut ThreadRecord, cpu: CpuId) {
        if t.cpu == cpu {
            return;
        }
        let queued = t.is_queued();
        self.dequeue_record(t);
        self.migrate(t, cpu);
        if queued && t.on_lwk_class() {
            if let Some(slot) = self.slots.get(cpu.as_usize()) {
                self.enqueue_record(t, slot, false);
            }
        }
    }

    pub(crate) fn enqueue_record(&self, t: &mut ThreadRecord, slot: &CpuSlot, at_head: bool) {
        let mut rq = slot.rq().lock();
        let handle = rq
            .queue
            .enqueue(t.tid, t.sched.prio, t.sched.policy == Policy::RoundRobin, at_head);
        slot.stats().record_running(rq.queue.nr_running());
        t.rq = Some((slot.cpu(), handle));
    }

    // -----------------------------------------------------------------------
    // Process lifecycle
    // -----------------------------------------------------------------------

    /// Registers the HPC process founded by `leader`.
    ///
    /// Every reserved CPU of the layout must already be in the partition.
    pub fn on_process_init(
        &self,
        leader: Tid,
        layout: ProcessLayout,
        options: LwkOptions,
    ) -> Result<Arc<LwkProcess>, SchedError> {
        layout.validate()?;
        self.check_mask(&layout.util_cpus)?;
        self.check_mask(&layout.original_allowed)?;
        for cpu in layout.lwkcpus.iter() {
            if !self.slot(cpu)?.is_lwk() {
                return Err(SchedError::NotPartitionCpu(cpu));
            }
        }

        let pid = Pid::new(leader.as_u32());
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&leader).ok_or(SchedError::UnknownThread(leader))?;
        let process = {
            let mut processes = self.processes.lock();
            if processes.contains_key(&pid) {
                return Err(SchedError::ProcessExists(pid));
            }
            let process = Arc::new(LwkProcess::new(pid, layout, options));
            processes.insert(pid, Arc::clone(&process));
            process
        };
        t.tgid = pid;
        t.process = Some(pid);
        t.role = ThreadRole::Normal;
        kdebug!("sched: process {} registered on cpus {}", pid, process.layout().lwkcpus);
        Ok(process)
    }

    /// Prepares the partition for a launch of `pid` and moves the founding
    /// thread onto it. Returns the founding thread's CPU.
    pub fn on_process_start(&self, pid: Pid) -> Result<CpuId, SchedError> {
        let process = self.process(pid).ok_or(SchedError::UnknownProcess(pid))?;
        let lwkcpus = process.layout().lwkcpus;
        for cpu in lwkcpus.iter() {
            let slot = self.slot(cpu)?;
            slot.reset_commits();
            slot.stats().reset_launch();
            slot.idle_state().set_owner(Some(pid));
        }

        let leader = Tid::new(pid.as_u32());
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&leader).ok_or(SchedError::UnknownThread(leader))?;
        t.cpu_home = None;
        let cpu = self.next_cpu(t, &lwkcpus)?;
        t.allowed = lwkcpus;
        self.move_thread(t, cpu);
        if t.cpu_home.is_none() {
            self.commit_thread(t, cpu);
        }
        kinfo!("sched: process {} launched, leader on cpu {}", pid, cpu);
        Ok(cpu)
    }

    /// Releases everything `tid` holds and forgets it.
    pub fn on_thread_exit(&self, tid: Tid) -> Result<(), SchedError> {
        let mut threads = self.threads.lock();
        let mut t = threads.remove(&tid).ok_or(SchedError::UnknownThread(tid))?;
        if let Some(slot) = t.cpu_home.and_then(|c| self.slots.get(c.as_usize())) {
            slot.release_exclusive(tid);
        }
        self.uncommit_thread(&mut t);
        if let Some(key) = t.active_hints.key {
            self.groups.lock().release(key);
        }
        if let Some(process) = self.process_of(&t) {
            process.remove_movable(tid);
        }
        if t.role == ThreadRole::Idle {
            if let Some((cpu, _)) = t.rq {
                if let Some(slot) = self.slots.get(cpu.as_usize()) {
                    slot.rq().lock().queue.remove_idle();
                    slot.set_idle_tid(None);
                }
            }
        } else {
            self.dequeue_record(&mut t);
        }
        Ok(())
    }

    /// Tears down `pid`: its CPUs lose their owner and the launch
    /// statistics are summarized and logged.
    pub fn on_process_exit(&self, pid: Pid) -> Result<ProcessSummary, SchedError> {
        let process = self
            .processes
            .lock()
            .remove(&pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        let lwkcpus = process.layout().lwkcpus;
        let mut per_cpu = Vec::with_capacity(lwkcpus.weight());
        for cpu in lwkcpus.iter() {
            let slot = self.slot(cpu)?;
            slot.idle_state().set_owner(None);
            per_cpu.push((cpu, slot.stats().snapshot()));
        }
        let keys = self.groups.lock().keys().collect();
        let summary = ProcessSummary::new(pid, per_cpu, keys);
        summary.emit(process.options().stats_level);
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Thread creation
    // -----------------------------------------------------------------------

    /// Creates the record of `child`, forked from `parent`, and places it.
    /// Returns the CPU the child starts on.
    ///
    /// The parent's pending placement hints are consumed.
    pub fn fork(&self, parent: Tid, child: Tid, kind: CloneKind) -> Result<CpuId, SchedError> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&child) {
            return Err(SchedError::ThreadExists(child));
        }
        let p = threads.get(&parent).ok_or(SchedError::UnknownThread(parent))?;
        let hints = p.clone_hints.clone();
        let parent_home = p.cpu_home;
        let process = self.process_of(p);

        let mut t = ThreadRecord::new(child, p.comm.clone(), p.sched, p.cpu, p.allowed);
        t.sched.normal_prio = p.sched.prio;
        t.time_slice = p.orig_time_slice;
        t.orig_time_slice = p.orig_time_slice;

        match (process, kind) {
            (None, _) => {
                if let ThreadRole::Guest { saved } = p.role {
                    t.sched = saved.params;
                }
                if kind == CloneKind::Thread {
                    t.tgid = p.tgid;
                }
            }
            (Some(process), CloneKind::Thread) => {
                t.tgid = p.tgid;
                t.process = p.process;
                t.role = ThreadRole::Normal;
                let count = process.note_thread_created();
                let utility =
                    count <= process.options().util_threads || hints.flags.contains(CloneFlags::UTIL);
                if utility {
                    self.place_utility_thread(&process, &mut t, &hints, parent_home);
                } else {
                    t.allowed = process.layout().lwkcpus;
                    self.push_utility_threads(&mut threads, &process);
                    let placer = Placer::new(&self.slots, &process);
                    match placer.select_compute_unbounded(&t.allowed) {
                        Some(cpu) => {
                            self.commit_thread(&mut t, cpu);
                            t.cpu = cpu;
                        }
                        None => kwarn!("sched: no reserved CPU for thread {}", child),
                    }
                }
            }
            (Some(process), CloneKind::Process) => {
                t.sched = SchedParams::general_purpose(Behavior::empty());
                t.allowed = process.layout().original_allowed;
                if let Some(cpu) = t.allowed.first() {
                    t.cpu = cpu;
                }
            }
        }

        if let Some(p) = threads.get_mut(&parent) {
            p.clone_hints = CloneHints::default();
        }
        let cpu = t.cpu;
        kdebug!("sched: fork {} -> {} ({:?}) on cpu {}", parent, child, kind, cpu);
        threads.insert(child, t);
        Ok(cpu)
    }

    fn place_utility_thread(
        &self,
        process: &LwkProcess,
        t: &mut ThreadRecord,
        hints: &CloneHints,
        home: Option<CpuId>,
    ) {
        let placer = Placer::new(&self.slots, process);
        let allowed = t.allowed;
        let Some(placement) = placer.place_utility(&self.groups, t.tid, &allowed, hints, home) else {
            kwarn!("sched: utility thread {} keeps its default placement", t.tid);
            hints.report(false, false);
            return;
        };

        let behavior = hints.behavior;
        t.role = ThreadRole::Utility;
        t.allowed = placement.target.allowed();
        match placement.target {
            UtilityTarget::Reserved(cpu) => {
                if behavior.contains(Behavior::HIGH_PRIO) {
                    t.sched.prio = LWK_HIGH_PRIO;
                    t.sched.normal_prio = LWK_HIGH_PRIO;
                } else if behavior.contains(Behavior::LOW_PRIO) {
                    t.sched.prio = LWK_LOW_PRIO;
                    t.sched.normal_prio = LWK_LOW_PRIO;
                }
                if behavior.contains(Behavior::NON_COOP) {
                    t.sched.policy = Policy::RoundRobin;
                }
                self.commit_thread(t, cpu);
                t.cpu = cpu;
                if !behavior.contains(Behavior::EXCLUSIVE) && hints.location.is_empty() {
                    process.push_movable(t.tid);
                }
            }
            UtilityTarget::General(_) => {
                t.sched = SchedParams::general_purpose(behavior);
                if let Some(cpu) = placement.target.home() {
                    self.commit_thread(t, cpu);
                    t.cpu = cpu;
                }
            }
        }

        let behavior_ok = behavior.is_acceptable();
        t.active_hints = ActiveHints {
            behavior: if behavior_ok { behavior } else { Behavior::empty() },
            location: if placement.placement_honored {
                hints.location
            } else {
                Location::empty()
            },
            key: placement.key,
            nodes: hints.nodes,
        };
        hints.report(behavior_ok, placement.placement_honored);
    }

    /// Moves movable utility threads to general-purpose CPUs until a
    /// reserved CPU is free of commitments or the list runs out.
    fn push_utility_threads(&self, threads: &mut ThreadTable, process: &LwkProcess) {
        let placer = Placer::new(&self.slots, process);
        if placer.has_uncommitted_cpu() {
            return;
        }
        while let Some(tid) = process.pop_movable() {
            let Some(t) = threads.get_mut(&tid) else {
                continue;
            };
            let nodes = t
                .active_hints
                .location
                .contains(Location::USE_NODE_SET)
                .then_some(t.active_hints.nodes);
            let Some((mask, honored)) = placer.select_push_target(nodes) else {
                kwarn!("sched: no general-purpose CPU for utility thread {}, left in place", tid);
                continue;
            };

            let from = t.cpu_home;
            self.dequeue_record(t);
            t.sched = SchedParams::general_purpose(t.active_hints.behavior);
            self.uncommit_thread(t);
            if let Some(cpu) = mask.first() {
                self.commit_thread(t, cpu);
                t.cpu = cpu;
            }
            t.allowed = mask;
            if let Some(slot) = from.and_then(|c| self.slots.get(c.as_usize())) {
                slot.stats().bump(Counter::Pushed);
            }
            kdebug!(
                "sched: pushed utility thread {} from {:?} to {} (honored: {})",
                tid,
                from,
                mask,
                honored
            );

            if placer.has_uncommitted_cpu() {
                break;
            }
        }
    }
}

impl core::fmt::Debug for LwkScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LwkScheduler")
            .field("cpus", &self.slots.len())
            .field("lwkcpus", &self.lwkcpus())
            .field("power", &self.power)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitKind;
    use crate::groups::GroupKey;
    use crate::hints::Outcome;
    use crate::hints::ResultSlot;
    use crate::thread::HostClass;
    use crate::topology::UniformMachine;

    // 2 nodes x 2 cores x 2 threads. CPUs 0-1 stay general purpose.
    fn sched() -> LwkScheduler {
        let s = LwkScheduler::new(&UniformMachine::new(2, 2, 2), 8, PowerHints::HALT);
        s.activate_cpus(&mask("2-7")).unwrap();
        s
    }

    fn mask(list: &str) -> CpuMask {
        CpuMask::parse(list).unwrap()
    }

    fn tid(n: u32) -> Tid {
        Tid::new(n)
    }

    fn launch(s: &LwkScheduler, lwk: &str, options: LwkOptions) -> Pid {
        s.register_thread(ThreadRecord::new(tid(100), "a.out", SchedParams::fair(0), CpuId::new(0), mask("0-7")))
            .unwrap();
        let layout = ProcessLayout::new(mask(lwk), mask("0-1"), mask("0-7"));
        s.on_process_init(tid(100), layout, options).unwrap();
        s.on_process_start(Pid::new(100)).unwrap();
        Pid::new(100)
    }

    fn commits(s: &LwkScheduler, cpu: u32) -> (u32, u32) {
        let c = s.slot(CpuId::new(cpu)).unwrap().commits();
        (c.get(CommitKind::Compute), c.get(CommitKind::Utility))
    }

    // --- Launch ---

    #[test]
    fn leader_lands_on_first_cpu() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        let leader = s.thread(tid(100)).unwrap();
        assert_eq!(leader.cpu, CpuId::new(2));
        assert_eq!(leader.cpu_home, Some(CpuId::new(2)));
        assert_eq!(commits(&s, 2), (1, 0));
        assert_eq!(s.slot(CpuId::new(2)).unwrap().owner(), Some(Pid::new(100)));
    }

    #[test]
    fn init_rejects_cpus_outside_the_partition() {
        let s = sched();
        s.register_thread(ThreadRecord::new(tid(100), "a.out", SchedParams::fair(0), CpuId::new(0), mask("0-7")))
            .unwrap();
        let layout = ProcessLayout::new(mask("1-3"), mask("0"), mask("0-7"));
        assert_eq!(
            s.on_process_init(tid(100), layout, LwkOptions::default()).unwrap_err(),
            SchedError::NotPartitionCpu(CpuId::new(1))
        );
    }

    // --- Fork ---

    #[test]
    fn compute_threads_spread_then_overcommit() {
        let s = sched();
        launch(&s, "2-3", LwkOptions::default());
        assert_eq!(s.fork(tid(100), tid(101), CloneKind::Thread).unwrap(), CpuId::new(3));
        assert_eq!(s.fork(tid(100), tid(102), CloneKind::Thread).unwrap(), CpuId::new(2));
        assert_eq!(commits(&s, 2), (2, 0));
        assert_eq!(s.process(Pid::new(100)).unwrap().threads_created(), 2);
    }

    #[test]
    fn util_threads_option_makes_utility_threads() {
        let s = sched();
        let options = LwkOptions {
            util_threads: 1,
            ..LwkOptions::default()
        };
        launch(&s, "2-7", options);
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        let t = s.thread(tid(101)).unwrap();
        assert_eq!(t.role, ThreadRole::Utility);
        assert_eq!(t.cpu_home, Some(CpuId::new(7)));
        assert_eq!(commits(&s, 7), (0, 1));
        s.fork(tid(100), tid(102), CloneKind::Thread).unwrap();
        assert_eq!(s.thread(tid(102)).unwrap().role, ThreadRole::Normal);
    }

    #[test]
    fn process_fork_returns_to_general_scheduler() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        let cpu = s.fork(tid(100), tid(200), CloneKind::Process).unwrap();
        let t = s.thread(tid(200)).unwrap();
        assert_eq!(cpu, CpuId::new(0));
        assert_eq!(t.sched.class, HostClass::Fair);
        assert_eq!(t.allowed, mask("0-7"));
        assert_eq!(t.process, None);
        assert_eq!(t.cpu_home, None);
    }

    #[test]
    fn hints_are_consumed_and_reported() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        let result = ResultSlot::new();
        let req = PlacementRequest::new()
            .flags(CloneFlags::UTIL)
            .behavior(Behavior::HIGH_PRIO | Behavior::NON_COOP)
            .location(Location::LWK_CPU)
            .report_to(result.clone());
        s.set_clone_attr(tid(100), req).unwrap();
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();

        let t = s.thread(tid(101)).unwrap();
        assert_eq!(t.sched.prio, LWK_HIGH_PRIO);
        assert_eq!(t.sched.policy, Policy::RoundRobin);
        assert!(s.slot(t.cpu).unwrap().is_lwk());
        assert!(s.thread(tid(100)).unwrap().clone_hints.location.is_empty());
        assert_eq!(result.get().behavior, Outcome::Accepted);
        assert_eq!(result.get().placement, Outcome::Accepted);
        assert!(s.process(Pid::new(100)).unwrap().movable().is_empty());
    }

    #[test]
    fn unknown_behavior_is_rejected_but_placement_stands() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        let result = ResultSlot::new();
        let raw = PlacementRequest::from_raw(CloneFlags::UTIL.bits(), 1 << 20, Location::LWK_CPU.bits());
        s.set_clone_attr(tid(100), raw.report_to(result.clone())).unwrap();
        assert_eq!(result.get().behavior, Outcome::Requested);
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();

        let t = s.thread(tid(101)).unwrap();
        assert_eq!(t.role, ThreadRole::Utility);
        assert!(s.slot(t.cpu).unwrap().is_lwk());
        assert!(t.active_hints.behavior.is_empty());
        assert_eq!(t.active_hints.location, Location::LWK_CPU);
        assert_eq!(result.get().behavior, Outcome::Rejected);
        assert_eq!(result.get().placement, Outcome::Accepted);
    }

    #[test]
    fn invalid_hints_leave_pending_hints_alone() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        s.set_clone_attr(tid(100), PlacementRequest::new().location(Location::SAME_L2))
            .unwrap();
        let bad = PlacementRequest::new().location(Location::SAME_L1 | Location::DIFF_L1);
        assert_eq!(s.set_clone_attr(tid(100), bad), Err(SchedError::ConflictingLocation));
        assert_eq!(s.thread(tid(100)).unwrap().clone_hints.location, Location::SAME_L2);
    }

    // --- Push ---

    #[test]
    fn compute_fork_pushes_movable_utility_threads() {
        let s = sched();
        let options = LwkOptions {
            util_threads: 1,
            ..LwkOptions::default()
        };
        launch(&s, "2-3", options);
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        assert_eq!(s.thread(tid(101)).unwrap().cpu_home, Some(CpuId::new(3)));
        assert_eq!(s.process(Pid::new(100)).unwrap().movable(), vec![tid(101)]);

        let cpu = s.fork(tid(100), tid(102), CloneKind::Thread).unwrap();
        assert_eq!(cpu, CpuId::new(3));
        let pushed = s.thread(tid(101)).unwrap();
        assert_eq!(pushed.sched.class, HostClass::Fair);
        assert!(pushed.allowed.is_subset_of(&mask("0-1")));
        assert_eq!(commits(&s, 3), (1, 0));
        assert_eq!(s.slot(CpuId::new(3)).unwrap().stats().snapshot().pushed, 1);
    }

    // --- Migration and affinity ---

    #[test]
    fn migration_moves_the_commitment() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        let home = s.thread(tid(101)).unwrap().cpu_home.unwrap();
        s.set_task_cpu(tid(101), CpuId::new(5)).unwrap();
        assert_eq!(s.thread(tid(101)).unwrap().cpu_home, Some(CpuId::new(5)));
        assert_eq!(commits(&s, home.as_u32()), (0, 0));
        assert_eq!(commits(&s, 5), (1, 0));
        s.set_task_cpu(tid(101), CpuId::new(0)).unwrap();
        assert_eq!(s.thread(tid(101)).unwrap().cpu_home, Some(CpuId::new(5)));
    }

    #[test]
    fn next_cpu_preference_order() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        let t = s.thread(tid(101)).unwrap();
        assert_eq!(s.select_next_cpu(tid(101), &mask("2-7")).unwrap(), t.cpu);
        assert_eq!(s.select_next_cpu(tid(101), &mask("0-1")).unwrap(), CpuId::new(0));
        // The first CPU still carries the leader's own commitment.
        s.set_task_cpu(tid(100), CpuId::new(0)).unwrap();
        assert_eq!(s.select_next_cpu(tid(100), &mask("0-7")).unwrap(), CpuId::new(0));
    }

    #[test]
    fn disabled_affinity_reports_errno() {
        let s = sched();
        let mut options = LwkOptions::default();
        options.apply("lwksched-disable-setaffinity", Some("1")).unwrap();
        launch(&s, "2-7", options);
        assert_eq!(
            s.set_affinity(tid(100), &mask("4")),
            Err(SchedError::AffinityDisabled(1))
        );
        assert_eq!(s.slot(CpuId::new(2)).unwrap().stats().snapshot().setaffinity, 1);
    }

    #[test]
    fn silent_affinity_disable_keeps_the_cpu() {
        let s = sched();
        let mut options = LwkOptions::default();
        options.apply("lwksched-disable-setaffinity", Some("0")).unwrap();
        launch(&s, "2-7", options);
        assert_eq!(s.set_affinity(tid(100), &mask("4")), Ok(CpuId::new(2)));
        assert_eq!(s.thread(tid(100)).unwrap().allowed, mask("2-7"));
    }

    #[test]
    fn affinity_change_moves_the_thread() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        assert_eq!(s.set_affinity(tid(100), &mask("5")), Ok(CpuId::new(5)));
        assert_eq!(commits(&s, 2), (0, 0));
        assert_eq!(commits(&s, 5), (1, 0));
    }

    // --- Exit ---

    #[test]
    fn thread_exit_releases_everything() {
        let s = sched();
        launch(&s, "2-7", LwkOptions::default());
        let key = GroupKey::new(0x42).unwrap();
        let req = PlacementRequest::new()
            .flags(CloneFlags::UTIL)
            .behavior(Behavior::EXCLUSIVE)
            .key(key);
        s.set_clone_attr(tid(100), req).unwrap();
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        let home = s.thread(tid(101)).unwrap().cpu_home.unwrap();
        assert_eq!(s.slot(home).unwrap().exclusive_owner(), Some(tid(101)));
        assert_eq!(s.group_refcount(key), Some(1));

        s.on_thread_exit(tid(101)).unwrap();
        assert_eq!(s.slot(home).unwrap().exclusive_owner(), None);
        assert_eq!(s.group_refcount(key), None);
        assert_eq!(commits(&s, home.as_u32()), (0, 0));
        assert!(s.thread(tid(101)).is_none());
    }

    #[test]
    fn process_exit_summarizes_and_releases_ownership() {
        let s = sched();
        let pid = launch(&s, "2-3", LwkOptions::default());
        s.fork(tid(100), tid(101), CloneKind::Thread).unwrap();
        s.fork(tid(100), tid(102), CloneKind::Thread).unwrap();
        let summary = s.on_process_exit(pid).unwrap();
        assert_eq!(summary.per_cpu.len(), 2);
        assert_eq!(summary.totals.max_compute_level, 2);
        assert_eq!(s.slot(CpuId::new(2)).unwrap().owner(), None);
        assert!(s.process(pid).is_none());
        assert_eq!(s.on_process_exit(pid).unwrap_err(), SchedError::UnknownProcess(pid));
    }

    // --- Partition ---

    #[test]
    fn deactivation_gives_guests_back() {
        let s = sched();
        s.register_idle(CpuId::new(4), tid(900)).unwrap();
        let guest = ThreadRecord::new(tid(50), "kworker/4:0", SchedParams::fair(-5), CpuId::new(4), mask("4"));
        let before = guest.sched;
        s.register_thread(guest).unwrap();
        assert_eq!(s.assimilate(tid(50), CpuId::new(4)), Ok(Assimilation::Guest));
        {
            let slot = s.slot(CpuId::new(4)).unwrap();
            let mut threads = s.threads.lock();
            let t = threads.get_mut(&tid(50)).unwrap();
            s.enqueue_record(t, slot, false);
        }

        s.deactivate_cpus(&mask("4")).unwrap();
        let t = s.thread(tid(50)).unwrap();
        assert_eq!(t.role, ThreadRole::Unassimilated);
        assert_eq!(t.sched, before);
        assert!(!t.is_queued());
        let slot = s.slot(CpuId::new(4)).unwrap();
        assert!(!slot.is_lwk());
        assert_eq!(slot.idle_tid(), None);
        assert_eq!(slot.rq().lock().queue.nr_running(), 0);
        assert!(matches!(s.thread(tid(900)).unwrap().role, ThreadRole::Guest { .. }));
    }

    #[test]
    fn idle_registration_requires_a_reserved_cpu() {
        let s = sched();
        assert_eq!(
            s.register_idle(CpuId::new(0), tid(900)),
            Err(SchedError::NotPartitionCpu(CpuId::new(0)))
        );
        s.register_idle(CpuId::new(2), tid(901)).unwrap();
        assert_eq!(s.thread(tid(901)).unwrap().role, ThreadRole::Idle);
        assert_eq!(
            s.slot(CpuId::new(2)).unwrap().rq().lock().queue.idle(),
            Some(tid(901))
        );
    }

    #[test]
    fn syscall_migration_honors_the_option() {
        let s = sched();
        let options = LwkOptions {
            move_syscalls_disable: true,
            ..LwkOptions::default()
        };
        launch(&s, "2-7", options);
        assert_eq!(s.syscall_migration(tid(100)), Ok(false));
        s.register_thread(ThreadRecord::new(tid(7), "bash", SchedParams::fair(0), CpuId::new(3), mask("0-7")))
            .unwrap();
        assert_eq!(s.syscall_migration(tid(7)), Ok(true));
        assert_eq!(s.slot(CpuId::new(3)).unwrap().stats().snapshot().sysc_migr, 1);
    }
}
