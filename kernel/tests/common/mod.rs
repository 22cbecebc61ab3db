//! Shared harness for the scenario tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use cpusched::scheduler::{Platform, SchedConfig, Scheduler, SimPlatform, Tunables};
use cpusched::{SchedAttr, Task, TaskRef};

pub const MS: u64 = 1_000_000;
pub const US: u64 = 1_000;

pub type Sim = Scheduler<SimPlatform>;

pub fn sim(nr_cpus: usize) -> Sim {
    Scheduler::new(SimPlatform::new(), nr_cpus, SchedConfig::new()).unwrap()
}

pub fn sim_with(nr_cpus: usize, tun: Tunables) -> Sim {
    Scheduler::new(SimPlatform::new(), nr_cpus, SchedConfig::from_tunables(tun)).unwrap()
}

/// New task already handed to the scheduler
pub fn spawn<P: Platform>(s: &Scheduler<P>, name: &str, attr: SchedAttr) -> TaskRef {
    let task = Task::new(name, attr);
    s.wake_up_new_task(&task).unwrap();
    task
}

/// One timer interrupt of `ns` on every CPU, each followed by the
/// return-from-interrupt preemption check
pub fn tick(s: &Sim, ns: u64) {
    s.platform().advance(ns);
    for cpu in 0..s.nr_cpus() {
        s.scheduler_tick(cpu);
    }
    for cpu in 0..s.nr_cpus() {
        s.check_preempt(cpu);
    }
}

pub fn run_ticks(s: &Sim, n: usize, ns: u64) {
    for _ in 0..n {
        tick(s, ns);
    }
}

pub fn exec_ns(task: &TaskRef) -> u64 {
    task.stats().snapshot().sum_exec_ns
}

pub fn current_id<P: Platform>(s: &Scheduler<P>, cpu: usize) -> u64 {
    s.current(cpu).map(|t| t.id()).unwrap_or(u64::MAX)
}

type Hook = Box<dyn FnOnce(&Scheduler<HookPlatform>) + Send>;

/// [`SimPlatform`] that runs one callback at a chosen `irq_save`, the way
/// an interrupt would land at that point of a scheduler call
pub struct HookPlatform {
    pub sim: SimPlatform,
    sched: AtomicPtr<Scheduler<HookPlatform>>,
    countdown: AtomicUsize,
    hook: Mutex<Option<Hook>>,
}

impl HookPlatform {
    /// Run `hook` at the `nth` interrupt-masking call from now (1-based)
    pub fn arm(&self, nth: usize, hook: impl FnOnce(&Scheduler<HookPlatform>) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
        self.countdown.store(nth, Ordering::SeqCst);
    }

    pub fn fired(&self) -> bool {
        self.countdown.load(Ordering::SeqCst) == 0 && self.hook.lock().unwrap().is_none()
    }
}

/// Scheduler on a [`HookPlatform`]; boxed so the platform can point back
/// at it
pub fn hooked(nr_cpus: usize) -> Box<Scheduler<HookPlatform>> {
    let platform = HookPlatform {
        sim: SimPlatform::new(),
        sched: AtomicPtr::new(std::ptr::null_mut()),
        countdown: AtomicUsize::new(0),
        hook: Mutex::new(None),
    };
    let s = Box::new(Scheduler::new(platform, nr_cpus, SchedConfig::new()).unwrap());
    let ptr = &*s as *const Scheduler<HookPlatform> as *mut Scheduler<HookPlatform>;
    s.platform().sched.store(ptr, Ordering::SeqCst);
    s
}

impl Platform for HookPlatform {
    fn now_ns(&self) -> u64 {
        self.sim.now_ns()
    }

    fn this_cpu(&self) -> usize {
        self.sim.this_cpu()
    }

    fn send_reschedule_ipi(&self, cpu: usize) {
        self.sim.send_reschedule_ipi(cpu)
    }

    fn irq_save(&self) -> bool {
        let enabled = self.sim.irq_save();
        let due = self
            .countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_or(false, |n| n == 1);
        if due {
            let hook = self.hook.lock().unwrap().take();
            let sched = self.sched.load(Ordering::SeqCst);
            if let (Some(hook), false) = (hook, sched.is_null()) {
                // SAFETY: set by `hooked` to the boxed scheduler owning this
                // platform, which outlives every call made through it
                hook(unsafe { &*sched });
            }
        }
        enabled
    }

    fn irq_restore(&self, enabled: bool) {
        self.sim.irq_restore(enabled)
    }

    unsafe fn switch_to(&self, prev: &TaskRef, next: &TaskRef) -> TaskRef {
        self.sim.switch_to(prev, next)
    }

    fn release_task(&self, task: &TaskRef) {
        self.sim.release_task(task)
    }
}
