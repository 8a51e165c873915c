//! The scheduling-class interface.
//!
//! The host scheduler core drives a class through a fixed set of hooks:
//! queueing, picking, ticking, CPU selection and fork. [`SchedClass`]
//! names that set; [`LwkScheduler`] is its only implementation.
//!
//! A thread stays in its run queue while it runs. `curr` in the CPU's
//! [`CpuRq`](crate::slot::CpuRq) records which queued thread the host is
//! running.

use bitflags::bitflags;
use lwk_core::id::{CpuId, Tid};
use lwk_core::ktrace;

use crate::error::SchedError;
use crate::placement::Placer;
use crate::runqueue::bucket_for_prio;
use crate::scheduler::{CloneKind, LwkScheduler};
use crate::stats::Counter;
use crate::thread::{Policy, ThreadRole};

/// Why the host asks for a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The thread is waking up.
    Wake,
    /// The thread was just created.
    Fork,
    /// Any other balancing point, such as `exec`.
    Other,
}

bitflags! {
    /// Flags of [`SchedClass::enqueue_task`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqueueFlags: u32 {
        /// Queue at the head of the bucket instead of the tail.
        const HEAD = 1 << 0;
    }
}

/// Hooks the host scheduler core calls on a scheduling class.
pub trait SchedClass {
    /// Makes `tid` runnable on `cpu`, assimilating it first.
    fn enqueue_task(&self, cpu: CpuId, tid: Tid, flags: EnqueueFlags) -> Result<(), SchedError>;

    /// Removes `tid` from the run queue of `cpu`.
    fn dequeue_task(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError>;

    /// Moves the running thread of `cpu` behind its peers.
    fn yield_task(&self, cpu: CpuId) -> Result<(), SchedError>;

    /// Returns `true` (and requests a reschedule) if the newly woken `tid`
    /// should preempt the running thread of `cpu`.
    fn check_preempt_curr(&self, cpu: CpuId, tid: Tid) -> Result<bool, SchedError>;

    /// Picks the next thread to run on `cpu`.
    fn pick_next_task(&self, cpu: CpuId) -> Result<Option<Tid>, SchedError>;

    /// `tid` stops running on `cpu`.
    fn put_prev_task(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError>;

    /// Chooses the CPU `tid` should run on; `cpu` is the host's proposal.
    fn select_task_rq(&self, tid: Tid, cpu: CpuId, reason: WakeReason) -> Result<CpuId, SchedError>;

    /// Timer tick for the running thread `tid` of `cpu`.
    fn task_tick(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError>;

    /// Round-robin interval of `tid` in ticks, or 0 if it is not
    /// time-sliced.
    fn get_rr_interval(&self, tid: Tid) -> Result<u32, SchedError>;

    /// The priority of queued thread `tid` changed from `old_prio`.
    /// Returns whether a reschedule was requested.
    fn prio_changed(&self, cpu: CpuId, tid: Tid, old_prio: i32) -> Result<bool, SchedError>;

    /// `tid` just joined this class. Returns whether a reschedule was
    /// requested.
    fn switched_to(&self, cpu: CpuId, tid: Tid) -> Result<bool, SchedError>;

    /// `child` was forked from `parent`.
    fn task_fork(&self, parent: Tid, child: Tid, kind: CloneKind) -> Result<CpuId, SchedError>;
}

fn preempts(prio: i32, curr_prio: i32) -> bool {
    bucket_for_prio(prio) < bucket_for_prio(curr_prio)
}

impl SchedClass for LwkScheduler {
    fn enqueue_task(&self, cpu: CpuId, tid: Tid, flags: EnqueueFlags) -> Result<(), SchedError> {
        let slot = self.slot(cpu)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        self.assimilate_record(t, slot);
        if !t.on_lwk_class() || t.role == ThreadRole::Idle || t.is_queued() {
            return Ok(());
        }
        self.enqueue_record(t, slot, flags.contains(EnqueueFlags::HEAD));
        ktrace!("class: enqueue {} on cpu {}", tid, cpu);
        Ok(())
    }

    fn dequeue_task(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError> {
        self.slot(cpu)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        self.dequeue_record(t);
        Ok(())
    }

    fn yield_task(&self, cpu: CpuId) -> Result<(), SchedError> {
        let slot = self.slot(cpu)?;
        let threads = self.threads.lock();
        let mut rq = slot.rq().lock();
        let handle = rq
            .curr
            .and_then(|curr| threads.get(&curr))
            .and_then(|t| t.rq)
            .filter(|(c, _)| *c == cpu)
            .map(|(_, h)| h);
        if let Some(handle) = handle {
            if !rq.queue.is_alone(handle) {
                rq.queue.requeue(handle, false);
            }
        }
        Ok(())
    }

    fn check_preempt_curr(&self, cpu: CpuId, tid: Tid) -> Result<bool, SchedError> {
        let slot = self.slot(cpu)?;
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        let curr = slot.rq().lock().curr;
        let Some(curr_prio) = curr.and_then(|c| threads.get(&c)).map(|c| c.sched.prio) else {
            return Ok(false);
        };
        if preempts(t.sched.prio, curr_prio) {
            slot.idle_state().request_resched();
            return Ok(true);
        }
        Ok(false)
    }

    fn pick_next_task(&self, cpu: CpuId) -> Result<Option<Tid>, SchedError> {
        let slot = self.slot(cpu)?;
        let threads = self.threads.lock();
        let next = {
            let mut rq = slot.rq().lock();
            let next = rq.queue.pick_highest();
            rq.curr = next;
            next
        };
        if next
            .and_then(|tid| threads.get(&tid))
            .is_some_and(|t| matches!(t.role, ThreadRole::Guest { .. }))
        {
            slot.stats().bump(Counter::GuestDispatch);
        }
        Ok(next)
    }

    fn put_prev_task(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError> {
        let mut rq = self.slot(cpu)?.rq().lock();
        if rq.curr == Some(tid) {
            rq.curr = None;
        }
        Ok(())
    }

    fn select_task_rq(&self, tid: Tid, cpu: CpuId, reason: WakeReason) -> Result<CpuId, SchedError> {
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        let Some(process) = self.process_of(t) else {
            return Ok(cpu);
        };
        let placer = Placer::new(&self.slots, &process);

        let mut next = cpu;
        match reason {
            WakeReason::Wake => {
                if let Some(home) = t.cpu_home.filter(|&h| t.allowed.contains(h)) {
                    next = home;
                }
            }
            WakeReason::Fork => {
                return Ok(placer.select_compute_unbounded(&t.allowed).unwrap_or(cpu));
            }
            WakeReason::Other => {}
        }

        if t.allowed.intersects(&self.lwkcpus()) {
            if t.allowed.contains(next) {
                let overcommitted = self
                    .slots
                    .get(next.as_usize())
                    .is_some_and(|s| s.commits().is_overcommitted());
                if overcommitted {
                    if let Some(better) = placer.select_compute_cpu(&t.allowed, 0) {
                        next = better;
                    }
                }
            } else if let Some(c) = placer.select_compute_unbounded(&t.allowed) {
                next = c;
            }
        }
        Ok(next)
    }

    fn task_tick(&self, cpu: CpuId, tid: Tid) -> Result<(), SchedError> {
        let slot = self.slot(cpu)?;
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&tid).ok_or(SchedError::UnknownThread(tid))?;
        if slot.is_lwk() {
            slot.stats().bump(Counter::TimerPop);
            if t.sched.policy != Policy::RoundRobin {
                return Ok(());
            }
        }

        t.time_slice = t.time_slice.saturating_sub(1);
        if t.time_slice > 0 {
            return Ok(());
        }
        t.time_slice = t.orig_time_slice;

        let Some((_, handle)) = t.rq.filter(|(c, _)| *c == cpu) else {
            return Ok(());
        };
        let mut rq = slot.rq().lock();
        if !rq.queue.is_alone(handle) {
            rq.queue.requeue(handle, false);
            drop(rq);
            slot.idle_state().request_resched();
        }
        Ok(())
    }

    fn get_rr_interval(&self, tid: Tid) -> Result<u32, SchedError> {
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        Ok(if t.sched.policy == Policy::RoundRobin {
            t.orig_time_slice
        } else {
            0
        })
    }

    fn prio_changed(&self, cpu: CpuId, tid: Tid, old_prio: i32) -> Result<bool, SchedError> {
        let slot = self.slot(cpu)?;
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        if !t.is_queued() {
            return Ok(false);
        }
        let curr = slot.rq().lock().curr;
        let resched = if curr == Some(tid) {
            // Dropped below its old bucket.
            preempts(old_prio, t.sched.prio)
        } else {
            curr.and_then(|c| threads.get(&c))
                .is_some_and(|c| preempts(t.sched.prio, c.sched.prio))
        };
        if resched {
            slot.idle_state().request_resched();
        }
        Ok(resched)
    }

    fn switched_to(&self, cpu: CpuId, tid: Tid) -> Result<bool, SchedError> {
        let slot = self.slot(cpu)?;
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(SchedError::UnknownThread(tid))?;
        let curr = slot.rq().lock().curr;
        if !t.is_queued() || curr == Some(tid) {
            return Ok(false);
        }
        let resched = curr
            .and_then(|c| threads.get(&c))
            .is_some_and(|c| preempts(t.sched.prio, c.sched.prio));
        if resched {
            slot.idle_state().request_resched();
        }
        Ok(resched)
    }

    fn task_fork(&self, parent: Tid, child: Tid, kind: CloneKind) -> Result<CpuId, SchedError> {
        self.fork(parent, child, kind)
    }
}
