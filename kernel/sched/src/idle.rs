//! Idle / power loop of a reserved CPU.
//!
//! When a reserved CPU has nothing but its idle task to run, the idle task
//! parks the CPU in a low-power wait. The depth of that wait is a pure
//! function of whether a live process currently owns the CPU: owned CPUs
//! take a shallow state because work is expected back soon, unowned CPUs
//! go deep.
//!
//! Wake-ups use a generation counter: the idle loop samples it before the
//! final need-resched check and hands it to the platform, which must
//! return from [`IdlePlatform::park`] as soon as the generation moves.
//! Ownership changes publish the new owner, issue a full fence, then bump
//! the generation; the idle loop issues the matching fence before it
//! samples the owner, so a CPU already mid-park can never miss a new owner.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

use lwk_core::id::{CpuId, Pid};
use lwk_core::sync::OwnerCell;
use lwk_core::{kdebug, ktrace};

/// How deep a parked CPU sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepDepth {
    /// Fast exit latency; used while a process owns the CPU.
    Shallow,
    /// Best power saving; used while the CPU is unowned.
    Deep,
}

/// Picks the sleep depth for the current ownership state.
pub const fn sleep_depth(owner: Option<Pid>) -> SleepDepth {
    match owner {
        Some(_) => SleepDepth::Shallow,
        None => SleepDepth::Deep,
    }
}

// ---------------------------------------------------------------------------
// Power-state hints
// ---------------------------------------------------------------------------

/// How the platform should park the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkHint {
    /// `MWAIT` with the given EAX hint (C-state in bits 7:4, sub-state in 3:0).
    Mwait(u32),
    /// Plain `HLT`.
    Halt,
}

/// The park hints used for each sleep depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerHints {
    /// Hint for [`SleepDepth::Shallow`].
    pub shallow: ParkHint,
    /// Hint for [`SleepDepth::Deep`].
    pub deep: ParkHint,
}

impl PowerHints {
    /// Halt for both depths; used when MWAIT is unavailable.
    pub const HALT: Self = Self {
        shallow: ParkHint::Halt,
        deep: ParkHint::Halt,
    };

    /// Derives hints from CPUID leaf 5.
    ///
    /// `max_leaf` is CPUID.0:EAX; `ecx`/`edx` are CPUID.5:ECX/EDX. The
    /// shallow hint targets C1, the deep hint the deepest C-state with at
    /// least one enumerated sub-state, using its deepest sub-state.
    pub fn from_cpuid(max_leaf: u32, ecx: u32, edx: u32) -> Self {
        const MWAIT_EXTENSIONS: u32 = 1 << 0;

        if max_leaf < 5 || ecx & MWAIT_EXTENSIONS == 0 {
            return Self::HALT;
        }
        let substates = |cstate: u32| (edx >> (cstate * 4)) & 0xf;
        let shallow = if substates(1) > 0 {
            ParkHint::Mwait(0x00)
        } else {
            ParkHint::Halt
        };
        let deep = (1..8)
            .rev()
            .find(|&c| substates(c) > 0)
            .map_or(shallow, |c| ParkHint::Mwait(((c - 1) << 4) | (substates(c) - 1)));
        Self { shallow, deep }
    }

    /// Returns the hint for `depth`.
    pub const fn hint(&self, depth: SleepDepth) -> ParkHint {
        match depth {
            SleepDepth::Shallow => self.shallow,
            SleepDepth::Deep => self.deep,
        }
    }
}

impl Default for PowerHints {
    fn default() -> Self {
        Self::HALT
    }
}

// ---------------------------------------------------------------------------
// Idle state
// ---------------------------------------------------------------------------

/// Cross-CPU visible idle state of one reserved CPU.
#[derive(Debug, Default)]
pub struct IdleState {
    in_partition: AtomicBool,
    need_resched: AtomicBool,
    owner: OwnerCell,
    wake_seq: AtomicU64,
}

impl IdleState {
    /// Creates the state of a CPU outside the partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while the CPU belongs to the reserved partition.
    pub fn in_partition(&self) -> bool {
        self.in_partition.load(Ordering::Acquire)
    }

    /// Adds or removes the CPU from the partition and wakes the idle task.
    pub fn set_in_partition(&self, member: bool) {
        self.in_partition.store(member, Ordering::Release);
        fence(Ordering::SeqCst);
        self.kick();
    }

    /// The process currently owning the CPU.
    pub fn owner(&self) -> Option<Pid> {
        self.owner.get().map(Pid::new)
    }

    /// Publishes a new owner, then wakes the idle task so it re-evaluates
    /// its sleep depth.
    pub fn set_owner(&self, owner: Option<Pid>) {
        self.owner.set(owner.map(Pid::as_u32));
        fence(Ordering::SeqCst);
        self.kick();
    }

    /// Marks a reschedule as pending and wakes the idle task.
    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
        self.kick();
    }

    /// `true` if a reschedule is pending.
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Clears a pending reschedule, returning whether one was pending.
    pub fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    /// Current wake generation.
    pub fn wake_seq(&self) -> u64 {
        self.wake_seq.load(Ordering::Acquire)
    }

    /// Advances the wake generation, releasing any parked idle loop.
    pub fn kick(&self) {
        self.wake_seq.fetch_add(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Idle loop
// ---------------------------------------------------------------------------

/// Platform hooks used by the idle loop.
pub trait IdlePlatform {
    /// Parks `cpu` using `hint`.
    ///
    /// Must return on any interrupt and as soon as `state.wake_seq()` no
    /// longer equals `seq`. Spurious returns are allowed.
    fn park(&self, cpu: CpuId, hint: ParkHint, state: &IdleState, seq: u64);

    /// Runs the host scheduler on `cpu`; called after a reschedule request.
    fn schedule(&self, cpu: CpuId);
}

/// Counts of what an idle loop did before it exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleReport {
    /// Parks in the shallow state.
    pub shallow_parks: u64,
    /// Parks in the deep state.
    pub deep_parks: u64,
    /// Calls into the host scheduler.
    pub reschedules: u64,
}

/// The idle task body of one reserved CPU.
pub struct IdleLoop<'a, P: IdlePlatform> {
    cpu: CpuId,
    state: &'a IdleState,
    hints: PowerHints,
    platform: &'a P,
}

impl<'a, P: IdlePlatform> IdleLoop<'a, P> {
    /// Creates the loop for `cpu`.
    pub fn new(cpu: CpuId, state: &'a IdleState, hints: PowerHints, platform: &'a P) -> Self {
        Self {
            cpu,
            state,
            hints,
            platform,
        }
    }

    /// Runs until the CPU leaves the partition.
    ///
    /// The need-resched flag is checked after the pre-park fence so a
    /// request racing with the park is never slept through.
    pub fn run(&self) -> IdleReport {
        let mut report = IdleReport::default();
        kdebug!("idle: cpu {} entering idle loop", self.cpu);
        while self.state.in_partition() {
            while !self.state.need_resched() {
                let seq = self.state.wake_seq();
                fence(Ordering::SeqCst);
                if self.state.need_resched() || !self.state.in_partition() {
                    break;
                }
                let depth = sleep_depth(self.state.owner());
                match depth {
                    SleepDepth::Shallow => report.shallow_parks += 1,
                    SleepDepth::Deep => report.deep_parks += 1,
                }
                ktrace!("idle: cpu {} parking {:?}", self.cpu, depth);
                self.platform
                    .park(self.cpu, self.hints.hint(depth), self.state, seq);
            }
            if self.state.take_resched() {
                report.reschedules += 1;
                self.platform.schedule(self.cpu);
            }
        }
        kdebug!("idle: cpu {} left the partition", self.cpu);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    // --- Sleep depth ---

    #[test]
    fn owned_cpus_sleep_shallow() {
        assert_eq!(sleep_depth(Some(Pid::new(7))), SleepDepth::Shallow);
        assert_eq!(sleep_depth(None), SleepDepth::Deep);
    }

    // --- CPUID decoding ---

    #[test]
    fn no_mwait_means_halt() {
        assert_eq!(PowerHints::from_cpuid(4, 1, 0x1120), PowerHints::HALT);
        assert_eq!(PowerHints::from_cpuid(0xd, 0, 0x1120), PowerHints::HALT);
    }

    #[test]
    fn deepest_enumerated_state_is_deep() {
        // C1: 2 sub-states, C2: 1, C3: 0, C6: 2.
        let edx = (2 << 4) | (1 << 8) | (2 << 24);
        let hints = PowerHints::from_cpuid(0xd, 0x3, edx);
        assert_eq!(hints.shallow, ParkHint::Mwait(0x00));
        assert_eq!(hints.deep, ParkHint::Mwait(0x51));
        assert_eq!(hints.hint(SleepDepth::Deep), ParkHint::Mwait(0x51));
    }

    // --- Loop behavior ---

    /// Records parks and spins until kicked.
    #[derive(Default)]
    struct SpinPlatform {
        parks: Mutex<Vec<ParkHint>>,
    }

    impl IdlePlatform for SpinPlatform {
        fn park(&self, _cpu: CpuId, hint: ParkHint, state: &IdleState, seq: u64) {
            self.parks.lock().unwrap().push(hint);
            while state.wake_seq() == seq {
                std::thread::yield_now();
            }
        }

        fn schedule(&self, _cpu: CpuId) {}
    }

    fn wait_for_parks(platform: &SpinPlatform, n: usize) {
        while platform.parks.lock().unwrap().len() < n {
            std::thread::yield_now();
        }
    }

    #[test]
    fn loop_exits_immediately_outside_partition() {
        let state = IdleState::new();
        let platform = SpinPlatform::default();
        let report = IdleLoop::new(CpuId::new(0), &state, PowerHints::HALT, &platform).run();
        assert_eq!(report, IdleReport::default());
    }

    #[test]
    fn ownership_change_switches_depth_and_deactivation_exits() {
        let hints = PowerHints {
            shallow: ParkHint::Mwait(0x00),
            deep: ParkHint::Mwait(0x20),
        };
        let state = Arc::new(IdleState::new());
        let platform = Arc::new(SpinPlatform::default());
        state.set_in_partition(true);

        let handle = {
            let state = Arc::clone(&state);
            let platform = Arc::clone(&platform);
            std::thread::spawn(move || IdleLoop::new(CpuId::new(1), &state, hints, &*platform).run())
        };

        wait_for_parks(&platform, 1);
        state.set_owner(Some(Pid::new(42)));
        wait_for_parks(&platform, 2);
        state.request_resched();
        wait_for_parks(&platform, 3);
        state.set_in_partition(false);
        let report = handle.join().unwrap();

        let parks = platform.parks.lock().unwrap().clone();
        assert_eq!(parks[0], ParkHint::Mwait(0x20));
        assert_eq!(parks[1], ParkHint::Mwait(0x00));
        assert_eq!(report.reschedules, 1);
        assert_eq!(report.deep_parks, 1);
        assert!(report.shallow_parks >= 2);
    }

    #[test]
    fn pending_resched_is_never_slept_through() {
        let state = IdleState::new();
        state.set_in_partition(true);
        state.request_resched();

        struct ExitOnSchedule;
        impl IdlePlatform for ExitOnSchedule {
            fn park(&self, _: CpuId, _: ParkHint, _: &IdleState, _: u64) {
                panic!("parked with a reschedule pending");
            }
            fn schedule(&self, _: CpuId) {}
        }

        // Leave the partition from inside the schedule hook.
        struct Leave<'a>(&'a IdleState);
        impl IdlePlatform for Leave<'_> {
            fn park(&self, c: CpuId, h: ParkHint, s: &IdleState, q: u64) {
                ExitOnSchedule.park(c, h, s, q);
            }
            fn schedule(&self, _: CpuId) {
                self.0.set_in_partition(false);
            }
        }

        let platform = Leave(&state);
        let report = IdleLoop::new(CpuId::new(2), &state, PowerHints::HALT, &platform).run();
        assert_eq!(report.reschedules, 1);
        assert_eq!(report.shallow_parks + report.deep_parks, 0);
    }
}
