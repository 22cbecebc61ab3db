//! Scheduler Core - Per-CPU multi-class scheduling
//!
//! Entry points used by the rest of the kernel: `schedule`, the timer tick,
//! preemption checks, wake-ups and policy changes. Each CPU has its own
//! runqueue lock; cross-CPU operations take two locks in CPU-id order.
//!
//! # Locking
//! - Runqueue locks are taken with local interrupts masked ([`IrqGuard`])
//! - Two runqueue locks: lower CPU id first ([`Scheduler::double_rq_lock`])
//! - `balance_lock` is taken before any runqueue lock, never after
//! - No runqueue lock is held across [`Platform::switch_to`]
//!
//! # Reschedule requests
//! Class code raises a per-runqueue flag under the lock. The flag is moved
//! into the CPU's atomic `need_resched` before the lock is dropped, with a
//! reschedule IPI when the target is not the calling CPU.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use super::affinity::CpuMask;
use super::class::{DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
use super::error::{SchedError, SchedResult};
use super::policy::{clamp_nice, SchedAttr};
use super::runqueue::{move_task, RunQueue};
use super::statistics::{RqStats, SchedulerStats, SchedulerStatsSnapshot};
use crate::scheduler::config::SchedConfig;
use crate::scheduler::entity::{class_of, dl_period, OnRq, TaskSlot};
use crate::scheduler::realtime::DeadlineClass;
use crate::scheduler::switch::{IrqGuard, Platform};
use crate::scheduler::thread::{Task, TaskFlags, TaskRef, TaskState, TaskStats};
use crate::scheduler::MAX_CPUS;
use crate::{sched_assert, sched_error};

/// Per-CPU scheduler state
pub struct PerCpu {
    pub(crate) rq: Mutex<RunQueue>,
    need_resched: AtomicBool,
    preempt_count: AtomicU32,
}

impl PerCpu {
    fn new(rq: RunQueue) -> Self {
        Self {
            rq: Mutex::new(rq),
            need_resched: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
        }
    }
}

/// Multi-class SMP scheduler
pub struct Scheduler<P: Platform> {
    pub(crate) cpus: Vec<PerCpu>,
    pub(crate) config: SchedConfig,
    /// Serializes cross-runqueue balancing
    pub(crate) balance_lock: Mutex<()>,
    pub(crate) stats: SchedulerStats,
    platform: P,
}

/// Disables preemption on one CPU until dropped
pub struct PreemptGuard<'a, P: Platform> {
    sched: &'a Scheduler<P>,
    cpu: usize,
}

impl<P: Platform> Drop for PreemptGuard<'_, P> {
    fn drop(&mut self) {
        self.sched.preempt_enable(self.cpu);
    }
}

impl<P: Platform> Scheduler<P> {
    /// Scheduler for `nr_cpus` CPUs, each starting on its idle task
    pub fn new(platform: P, nr_cpus: usize, config: SchedConfig) -> SchedResult<Self> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(sched_error!(SchedError::CpuNotAvailable { cpu: nr_cpus }));
        }
        let tun = config.snapshot();
        tun.validate().map_err(|e| sched_error!(e))?;

        let cpus = (0..nr_cpus)
            .map(|cpu| PerCpu::new(RunQueue::new(cpu, Task::new_idle(cpu), tun)))
            .collect();

        log::info!(
            "[SCHED] {} CPU(s), latency {} ns, min granularity {} ns, RR quantum {} ns",
            nr_cpus,
            tun.sched_latency_ns,
            tun.min_granularity_ns,
            tun.rr_timeslice_ns
        );

        Ok(Self {
            cpus,
            config,
            balance_lock: Mutex::new(()),
            stats: SchedulerStats::new(),
            platform,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    fn pcpu(&self, cpu: usize) -> SchedResult<&PerCpu> {
        self.cpus.get(cpu).ok_or(SchedError::CpuNotAvailable { cpu })
    }

    /// Task currently owning `cpu`
    pub fn current(&self, cpu: usize) -> Option<TaskRef> {
        self.with_rq(cpu, RunQueue::curr_task).flatten()
    }

    pub fn need_resched(&self, cpu: usize) -> bool {
        self.cpus
            .get(cpu)
            .map_or(false, |p| p.need_resched.load(Ordering::Acquire))
    }

    /// Inspect a runqueue under its lock
    pub fn with_rq<R>(&self, cpu: usize, f: impl FnOnce(&RunQueue) -> R) -> Option<R> {
        let pcpu = self.cpus.get(cpu)?;
        let _irq = IrqGuard::new(&self.platform);
        let rq = pcpu.rq.lock();
        Some(f(&rq))
    }

    pub fn rq_stats(&self, cpu: usize) -> Option<RqStats> {
        self.with_rq(cpu, |rq| rq.stats)
    }

    /// Queued plus running non-idle tasks on `cpu`
    pub fn nr_runnable(&self, cpu: usize) -> usize {
        self.with_rq(cpu, RunQueue::nr_runnable).unwrap_or(0)
    }

    /// Runnable tasks system-wide, throttled deadline tasks included
    pub fn nr_runnable_total(&self) -> usize {
        (0..self.nr_cpus())
            .filter_map(|cpu| self.with_rq(cpu, |rq| rq.nr_runnable() + rq.nr_throttled()))
            .sum()
    }

    // ========================================================================
    // Locking helpers
    // ========================================================================

    pub(crate) fn lock_rq(&self, cpu: usize) -> MutexGuard<'_, RunQueue> {
        self.cpus[cpu].rq.lock()
    }

    /// Lock two distinct runqueues, lower CPU id first; guards in (a, b) order
    pub(crate) fn double_rq_lock(
        &self,
        a: usize,
        b: usize,
    ) -> (MutexGuard<'_, RunQueue>, MutexGuard<'_, RunQueue>) {
        sched_assert!(a != b, "double_rq_lock on a single runqueue");
        if a < b {
            let first = self.cpus[a].rq.lock();
            let second = self.cpus[b].rq.lock();
            (first, second)
        } else {
            let first = self.cpus[b].rq.lock();
            let second = self.cpus[a].rq.lock();
            (second, first)
        }
    }

    /// Lock the runqueue owning `task`, retrying if it migrates meanwhile
    fn task_rq_lock(&self, task: &Task) -> SchedResult<MutexGuard<'_, RunQueue>> {
        loop {
            let cpu = task.cpu();
            let rq = self.pcpu(cpu)?.rq.lock();
            if task.cpu() == cpu {
                if !rq.contains(task.id()) {
                    return Err(SchedError::TaskNotFound { task: task.id() });
                }
                return Ok(rq);
            }
        }
    }

    pub(crate) fn send_ipi(&self, cpu: usize) {
        self.platform.send_reschedule_ipi(cpu);
        SchedulerStats::inc(&self.stats.ipis_sent);
    }

    pub(crate) fn set_need_resched(&self, cpu: usize, from_cpu: usize) {
        self.cpus[cpu].need_resched.store(true, Ordering::Release);
        if cpu != from_cpu {
            self.send_ipi(cpu);
        }
    }

    /// Publish a pending reschedule request of `rq`
    pub(crate) fn flush_resched(&self, rq: &mut RunQueue, from_cpu: usize) {
        if rq.take_resched() {
            self.set_need_resched(rq.cpu, from_cpu);
        }
    }

    // ========================================================================
    // Preemption control
    // ========================================================================

    pub fn preempt_disable(&self, cpu: usize) {
        if let Some(pcpu) = self.cpus.get(cpu) {
            pcpu.preempt_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Re-enable preemption; reschedules if a request arrived meanwhile
    pub fn preempt_enable(&self, cpu: usize) {
        let Some(pcpu) = self.cpus.get(cpu) else {
            return;
        };
        let prev = pcpu
            .preempt_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if prev == 1 && pcpu.need_resched.load(Ordering::Acquire) {
            self.preempt_schedule(cpu);
        }
    }

    pub fn preempt_count(&self, cpu: usize) -> u32 {
        self.cpus
            .get(cpu)
            .map_or(0, |p| p.preempt_count.load(Ordering::Acquire))
    }

    pub fn preempt_guard(&self, cpu: usize) -> PreemptGuard<'_, P> {
        self.preempt_disable(cpu);
        PreemptGuard { sched: self, cpu }
    }

    // ========================================================================
    // schedule()
    // ========================================================================

    /// Voluntary entry: the current task may have set a sleeping state
    pub fn schedule(&self, cpu: usize) {
        self.__schedule(cpu, false);
    }

    /// Involuntary entry: the current task stays on the runqueue whatever
    /// its state says
    pub fn preempt_schedule(&self, cpu: usize) {
        self.__schedule(cpu, true);
    }

    fn __schedule(&self, cpu: usize, preempt: bool) {
        let Some(pcpu) = self.cpus.get(cpu) else {
            return;
        };
        if pcpu.preempt_count.load(Ordering::Acquire) > 0 {
            log::trace!("CPU{}: schedule with preemption disabled", cpu);
            return;
        }

        let irq = IrqGuard::new(&self.platform);
        let now = self.platform.now_ns();
        let mut rq = pcpu.rq.lock();
        rq.update_clock(now);
        pcpu.need_resched.store(false, Ordering::Release);

        let prev_id = rq.curr;
        let Some(prev) = rq.curr_task() else {
            return;
        };
        let prev_state = prev.state();

        // Only a voluntary call may take a sleeper off the runqueue. A waker
        // that set RUNNING in between keeps it on.
        if !preempt && !prev_state.is_runnable() {
            rq.deactivate_task(prev_id, DequeueFlags::SLEEP);
        }
        rq.update_curr();
        rq.put_prev_task(prev_id);

        // Affinity changed while it ran: keep it out of this pick, it is
        // moved once switched out
        let mut evicted = self.evict_prev(&mut rq, &prev, cpu);

        if rq.nr_running == 0 && rq.tun.idle_balance && self.nr_cpus() > 1 {
            drop(rq);
            self.idle_balance(cpu);
            rq = pcpu.rq.lock();
            rq.update_clock(self.platform.now_ns());
            pcpu.need_resched.store(false, Ordering::Release);

            // Woken while the lock was dropped: it is still rq.curr, so the
            // wake left it Current and out of every ready structure
            if rq.slot(prev_id).map_or(false, |s| s.on_rq == OnRq::Current) {
                rq.put_prev_task(prev_id);
                evicted |= self.evict_prev(&mut rq, &prev, cpu);
            }
        }

        let next_id = rq.pick_next_task();
        sched_assert!(rq.contains(next_id), "picked a task with no slot");
        rq.set_next_task(next_id);
        if next_id == prev_id {
            return;
        }

        rq.curr = next_id;
        if evicted {
            rq.activate_task(prev_id, EnqueueFlags::RESTORE);
        }
        rq.stats.nr_switches += 1;
        let Some(next) = rq.task(next_id).cloned() else {
            return;
        };
        drop(rq);

        SchedulerStats::inc(&self.stats.total_switches);
        if preempt || prev_state.is_runnable() {
            TaskStats::bump(&prev.stats().nivcsw);
        } else {
            TaskStats::bump(&prev.stats().nvcsw);
        }
        log::trace!("CPU{}: switch {} -> {}", cpu, prev_id, next_id);

        // SAFETY: no runqueue lock is held and interrupts are masked by
        // `irq`; `prev` was this CPU's current task and `next` was just
        // taken off this CPU's ready structures, so it runs nowhere else.
        let last = unsafe { self.platform.switch_to(&prev, &next) };
        self.finish_task_switch(last);
        drop(irq);
    }

    /// Take a queued `prev` whose affinity excludes `cpu` out of the pick
    fn evict_prev(&self, rq: &mut RunQueue, prev: &Task, cpu: usize) -> bool {
        let evict = !prev.is_idle()
            && !prev.can_run_on(cpu)
            && rq.slot(prev.id()).map_or(false, |s| s.on_rq == OnRq::Queued);
        if evict {
            rq.deactivate_task(prev.id(), DequeueFlags::SAVE);
        }
        evict
    }

    /// Cleanup for the task this CPU just switched away from
    fn finish_task_switch(&self, prev: TaskRef) {
        let id = prev.id();
        if prev.state().is_terminated() {
            let Ok(mut rq) = self.task_rq_lock(&prev) else {
                return;
            };
            if rq.curr == id {
                return;
            }
            if let Some(class) = rq.class_of(id) {
                class.task_dead(&mut rq, id);
            }
            let removed = rq.remove_slot(id);
            drop(rq);
            if removed.is_some() {
                self.platform.release_task(&prev);
                SchedulerStats::inc(&self.stats.total_released);
                log::debug!("task {} ({}) released", id, prev.name());
            }
        } else if !prev.is_idle() && !prev.can_run_on(prev.cpu()) {
            // Affinity changed while it was running
            let mask = prev.affinity();
            let moved = match mask.intersect(&CpuMask::first_n(self.nr_cpus())).first() {
                Some(dest) => self.migrate_task(&prev, dest),
                None => Err(SchedError::InvalidCpuMask { mask: mask.bits() }),
            };
            if let Err(e) = moved {
                // The tick keeps asking for a switch-out until the move works
                log::warn!("[SCHED] task {} stays on CPU{} outside its affinity: {}", id, prev.cpu(), e);
                prev.insert_flags(TaskFlags::MIGRATE_PENDING);
            }
        }
    }

    /// Run `preempt_schedule` if a reschedule is pending and allowed
    pub fn check_preempt(&self, cpu: usize) -> bool {
        let Some(pcpu) = self.cpus.get(cpu) else {
            return false;
        };
        if !pcpu.need_resched.load(Ordering::Acquire) || pcpu.preempt_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.preempt_schedule(cpu);
        true
    }

    /// Ask `cpu` to reconsider what it runs
    pub fn reschedule_cpu(&self, cpu: usize) {
        if cpu >= self.nr_cpus() {
            return;
        }
        self.set_need_resched(cpu, self.platform.this_cpu());
    }

    // ========================================================================
    // Timer tick
    // ========================================================================

    /// Periodic tick on `cpu`
    pub fn scheduler_tick(&self, cpu: usize) {
        let Some(pcpu) = self.cpus.get(cpu) else {
            return;
        };
        let now = self.platform.now_ns();
        let (expired, run_balance) = {
            let _irq = IrqGuard::new(&self.platform);
            let mut rq = pcpu.rq.lock();
            rq.tun = self.config.snapshot();
            rq.tick_clock(now);

            while let Some(id) = rq.dl.pop_expired(now) {
                DeadlineClass::replenish_timer_fired(&mut rq, id);
            }
            let expired = rq.take_expired_sleepers(now);

            let curr = rq.curr;
            let queued = rq.slot(curr).map_or(false, |s| s.on_rq == OnRq::Current);
            let class = rq.curr_class();
            class.task_tick(&mut rq, curr, queued);
            let stranded = rq.task(curr).map_or(false, |t| {
                t.flags().contains(TaskFlags::MIGRATE_PENDING) && !t.can_run_on(cpu)
            });
            if stranded {
                rq.resched_curr();
            }
            self.flush_resched(&mut rq, cpu);

            (expired, rq.clock % rq.tun.balance_interval_ticks == 0)
        };

        for task in expired {
            self.try_to_wake_up_state(&task, WakeFlags::empty(), TaskState::is_sleeping);
        }
        if run_balance && self.nr_cpus() > 1 {
            self.load_balance(cpu);
        }
    }

    // ========================================================================
    // Task lifecycle
    // ========================================================================

    /// Inherit scheduling attributes from `parent` before first activation
    pub fn sched_fork(&self, child: &TaskRef, parent: &TaskRef) {
        child.set_attr(parent.attr().for_child());
        child.set_affinity_mask(parent.affinity());
        child.set_cpu(parent.cpu());
    }

    /// Least loaded CPU `task` may run on
    fn select_fork_cpu(&self, task: &Task) -> SchedResult<usize> {
        let allowed = task.affinity().intersect(&CpuMask::first_n(self.nr_cpus()));
        allowed
            .iter()
            .min_by_key(|&cpu| (self.nr_runnable(cpu), cpu))
            .ok_or(SchedError::InvalidCpuMask { mask: task.affinity().bits() })
    }

    /// First activation of a new task; returns the CPU it landed on
    pub fn wake_up_new_task(&self, task: &TaskRef) -> SchedResult<usize> {
        let id = task.id();
        let attr = task.attr();
        attr.validate().map_err(|e| sched_error!(e))?;
        if (0..self.nr_cpus()).any(|cpu| self.with_rq(cpu, |rq| rq.contains(id)).unwrap_or(false)) {
            return Err(sched_error!(SchedError::TaskAlreadyExists { task: id }));
        }
        let cpu = self.select_fork_cpu(task).map_err(|e| sched_error!(e))?;
        let class = class_of(attr.policy);
        let this_cpu = self.platform.this_cpu();

        {
            let _irq = IrqGuard::new(&self.platform);
            let mut rq = self.lock_rq(cpu);
            rq.update_clock(self.platform.now_ns());
            let se = class.task_fork(&rq.tun, &attr);
            task.set_state(TaskState::Running);
            if !rq.insert_slot(TaskSlot::new(task.clone(), se)) {
                return Err(sched_error!(SchedError::TaskAlreadyExists { task: id }));
            }
            rq.activate_task(id, EnqueueFlags::INITIAL);
            rq.check_preempt_curr(id, WakeFlags::FORK);
            self.flush_resched(&mut rq, this_cpu);
        }

        SchedulerStats::inc(&self.stats.total_tasks);
        log::debug!("task {} ({}) started on CPU{} as {:?}", id, task.name(), cpu, attr.policy);
        Ok(cpu)
    }

    /// Wake a sleeping task; false if it was not asleep
    pub fn try_to_wake_up(&self, task: &TaskRef, flags: WakeFlags) -> bool {
        self.try_to_wake_up_state(task, flags, TaskState::is_sleeping)
    }

    pub fn wake_up_process(&self, task: &TaskRef) -> bool {
        self.try_to_wake_up(task, WakeFlags::empty())
    }

    /// Wake `task` only if its state satisfies `wakes`
    pub fn try_to_wake_up_state(
        &self,
        task: &TaskRef,
        flags: WakeFlags,
        wakes: fn(TaskState) -> bool,
    ) -> bool {
        if task.is_idle() || !wakes(task.state()) {
            return false;
        }
        let nr = self.nr_cpus();
        let this_cpu = self.platform.this_cpu();
        let _irq = IrqGuard::new(&self.platform);
        let now = self.platform.now_ns();

        loop {
            let src = task.cpu();
            if src >= nr {
                return false;
            }
            let class = class_of(task.policy());
            let dst = match class.select_task_rq(task, this_cpu, nr, flags) {
                cpu if cpu < nr => cpu,
                _ => src,
            };

            if dst == src {
                let mut rq = self.lock_rq(src);
                if task.cpu() != src {
                    continue;
                }
                return self.ttwu_activate(&mut rq, task, flags, wakes, this_cpu, now);
            }

            let (mut src_rq, mut dst_rq) = self.double_rq_lock(src, dst);
            if task.cpu() != src {
                continue;
            }
            // Still current or queued on its old CPU: wake it in place
            let on_rq = src_rq.slot(task.id()).map(|s| s.on_rq);
            if src_rq.curr == task.id() || matches!(on_rq, Some(OnRq::Queued | OnRq::Current)) {
                drop(dst_rq);
                return self.ttwu_activate(&mut src_rq, task, flags, wakes, this_cpu, now);
            }
            if !wakes(task.state()) || !move_task(&mut src_rq, &mut dst_rq, task.id()) {
                return false;
            }
            drop(src_rq);
            SchedulerStats::inc(&self.stats.total_migrations);
            return self.ttwu_activate(&mut dst_rq, task, flags | WakeFlags::MIGRATED, wakes, this_cpu, now);
        }
    }

    fn ttwu_activate(
        &self,
        rq: &mut RunQueue,
        task: &TaskRef,
        flags: WakeFlags,
        wakes: fn(TaskState) -> bool,
        this_cpu: usize,
        now: u64,
    ) -> bool {
        let id = task.id();
        let state = task.state();
        if !rq.contains(id) || !wakes(state) {
            return false;
        }
        if task.state_cell().compare_exchange(state, TaskState::Running).is_err() {
            return false;
        }

        rq.update_clock(now);
        rq.cancel_sleep_timer(id);
        let mut enqueue = EnqueueFlags::WAKEUP;
        if flags.contains(WakeFlags::MIGRATED) {
            enqueue |= EnqueueFlags::MIGRATED;
        }
        rq.activate_task(id, enqueue);
        rq.check_preempt_curr(id, flags);
        rq.stats.nr_wakeups += 1;
        TaskStats::bump(&task.stats().nr_wakeups);
        self.flush_resched(rq, this_cpu);
        log::trace!("CPU{}: woke task {}", rq.cpu, id);
        true
    }

    /// Put the current task of `cpu` to sleep in `state`
    pub fn sleep_current(&self, cpu: usize, state: TaskState) -> SchedResult<()> {
        let curr = self.current(cpu).ok_or(SchedError::CpuNotAvailable { cpu })?;
        if curr.is_idle() || !state.is_sleeping() {
            return Err(SchedError::TaskNotRunnable { task: curr.id() });
        }
        curr.set_state(state);
        self.schedule(cpu);
        Ok(())
    }

    /// Sleep for up to `timeout_ns`; returns the time left when woken early
    ///
    /// On a real CPU the call returns once the task runs again. Under a
    /// software platform it returns right after the switch, so the result
    /// is the full timeout unless the clock moved.
    pub fn schedule_timeout(&self, cpu: usize, timeout_ns: u64) -> u64 {
        let Some(curr) = self.current(cpu) else {
            return 0;
        };
        if curr.is_idle() || timeout_ns == 0 {
            self.schedule(cpu);
            return 0;
        }
        if curr.state() == TaskState::Running {
            curr.set_state(TaskState::Interruptible);
        }
        self.schedule_until(cpu, self.platform.now_ns().saturating_add(timeout_ns))
    }

    /// Sleep in the state the caller already set, until woken or until the
    /// clock reaches `expires`; returns the time left
    pub(crate) fn schedule_until(&self, cpu: usize, expires: u64) -> u64 {
        let Some(curr) = self.current(cpu).filter(|t| !t.is_idle()) else {
            self.schedule(cpu);
            return 0;
        };
        {
            let _irq = IrqGuard::new(&self.platform);
            let mut rq = self.lock_rq(cpu);
            rq.arm_sleep_timer(expires, curr.id());
        }
        self.schedule(cpu);

        // Resumed: whatever woke it, the timer must not fire later
        if self.current(curr.cpu()).map_or(false, |c| c.id() == curr.id()) {
            let _irq = IrqGuard::new(&self.platform);
            if let Ok(mut rq) = self.task_rq_lock(&curr) {
                rq.cancel_sleep_timer(curr.id());
            }
        }
        expires.saturating_sub(self.platform.now_ns())
    }

    /// Voluntarily give up the CPU
    pub fn yield_current(&self, cpu: usize) {
        let Some(pcpu) = self.cpus.get(cpu) else {
            return;
        };
        {
            let _irq = IrqGuard::new(&self.platform);
            let mut rq = pcpu.rq.lock();
            rq.update_clock(self.platform.now_ns());
            let curr = rq.curr;
            let class = rq.curr_class();
            class.yield_task(&mut rq, curr);
            rq.take_resched();
        }
        self.schedule(cpu);
    }

    /// Terminate the current task of `cpu`
    pub fn exit_current(&self, cpu: usize) {
        let Some(curr) = self.current(cpu) else {
            return;
        };
        if curr.is_idle() {
            log::warn!("CPU{}: idle task tried to exit", cpu);
            return;
        }
        curr.insert_flags(TaskFlags::EXITING);
        curr.set_state(TaskState::Zombie);
        log::debug!("task {} ({}) exiting", curr.id(), curr.name());
        self.schedule(cpu);
    }

    // ========================================================================
    // Policy, priority, affinity
    // ========================================================================

    /// Change policy and parameters
    pub fn set_scheduler(&self, task: &TaskRef, attr: SchedAttr) -> SchedResult<()> {
        attr.validate().map_err(|e| sched_error!(e))?;
        if task.is_idle() {
            return Err(sched_error!(SchedError::InvalidPolicy { policy: attr.policy as u32 }));
        }
        let tun = self.config.snapshot();
        let class = class_of(attr.policy);
        if class == SchedClass::Deadline {
            let period = dl_period(&tun, &attr);
            if tun.dl_budget(period) == 0 {
                return Err(sched_error!(SchedError::InvalidDeadlineParams { period_ns: period }));
            }
        }

        let this_cpu = self.platform.this_cpu();
        let _irq = IrqGuard::new(&self.platform);
        let mut rq = self.task_rq_lock(task).map_err(|e| sched_error!(e))?;
        rq.update_clock(self.platform.now_ns());
        let old = task.attr();
        change_attr(&mut rq, task, attr);
        self.flush_resched(&mut rq, this_cpu);
        log::info!(
            "task {} ({}): {:?} -> {:?}",
            task.id(),
            task.name(),
            old.policy,
            attr.policy
        );
        Ok(())
    }

    /// Change the nice value; out-of-range values are clamped
    pub fn set_user_nice(&self, task: &TaskRef, nice: i32) -> SchedResult<()> {
        let mut attr = task.attr();
        let nice = clamp_nice(nice);
        if attr.nice == nice {
            return Ok(());
        }
        attr.nice = nice;
        self.set_scheduler(task, attr)
    }

    /// Restrict the CPUs `task` may run on, moving it if needed
    pub fn set_affinity(&self, task: &TaskRef, mask: CpuMask) -> SchedResult<()> {
        let online = mask.intersect(&CpuMask::first_n(self.nr_cpus()));
        let Some(dest) = online.first() else {
            return Err(sched_error!(SchedError::InvalidCpuMask { mask: mask.bits() }));
        };
        if task.is_idle() {
            return Err(sched_error!(SchedError::MigrationNotAllowed {
                task: task.id(),
                from_cpu: task.cpu(),
                to_cpu: dest,
            }));
        }
        task.set_affinity_mask(mask);

        let cpu = task.cpu();
        if online.is_set(cpu) {
            task.remove_flags(TaskFlags::MIGRATE_PENDING);
            return Ok(());
        }
        let running = self.with_rq(cpu, |rq| rq.curr == task.id()).unwrap_or(false);
        if running {
            // Moved by finish_task_switch once it is off the CPU
            self.reschedule_cpu(cpu);
            return Ok(());
        }
        self.migrate_task(task, dest)
    }

    /// Move a task that is not currently running to `dest`
    pub fn migrate_task(&self, task: &TaskRef, dest: usize) -> SchedResult<()> {
        self.pcpu(dest)?;
        if !task.can_run_on(dest) || task.is_idle() {
            return Err(SchedError::MigrationNotAllowed {
                task: task.id(),
                from_cpu: task.cpu(),
                to_cpu: dest,
            });
        }
        let this_cpu = self.platform.this_cpu();
        let _irq = IrqGuard::new(&self.platform);
        loop {
            let src = task.cpu();
            if src == dest {
                return Ok(());
            }
            self.pcpu(src)?;
            let (mut src_rq, mut dst_rq) = self.double_rq_lock(src, dest);
            if task.cpu() != src {
                continue;
            }
            if src_rq.curr == task.id() {
                return Err(SchedError::TaskNotRunnable { task: task.id() });
            }
            if !move_task(&mut src_rq, &mut dst_rq, task.id()) {
                return Err(SchedError::TaskNotFound { task: task.id() });
            }
            let queued = dst_rq.slot(task.id()).map_or(false, |s| s.on_rq == OnRq::Queued);
            if queued {
                dst_rq.check_preempt_curr(task.id(), WakeFlags::MIGRATED);
                self.flush_resched(&mut dst_rq, this_cpu);
            }
            task.remove_flags(TaskFlags::MIGRATE_PENDING);
            SchedulerStats::inc(&self.stats.total_migrations);
            log::debug!("task {} migrated CPU{} -> CPU{}", task.id(), src, dest);
            return Ok(());
        }
    }

    /// Round-robin quantum of `task` (0 unless SCHED_RR)
    pub fn get_rr_interval(&self, task: &TaskRef) -> SchedResult<u64> {
        let _irq = IrqGuard::new(&self.platform);
        let rq = self.task_rq_lock(task)?;
        let class = rq.class_of(task.id()).ok_or(SchedError::TaskNotFound { task: task.id() })?;
        Ok(class.get_rr_interval(&rq, task.id()))
    }

    /// Dump per-CPU counters to the log
    pub fn show_stats(&self) {
        let global = self.stats();
        log::info!(
            "[SCHED] switches={} tasks={} released={} migrations={} ipis={}",
            global.total_switches,
            global.total_tasks,
            global.total_released,
            global.total_migrations,
            global.ipis_sent
        );
        for cpu in 0..self.nr_cpus() {
            if let Some((stats, nr)) = self.with_rq(cpu, |rq| (rq.stats, rq.nr_runnable())) {
                log::info!(
                    "  CPU{}: runnable={} switches={} preemptions={} idle_picks={} dl_throttles={}",
                    cpu,
                    nr,
                    stats.nr_switches,
                    stats.nr_preemptions,
                    stats.nr_idle_picks,
                    stats.nr_dl_throttles
                );
            }
        }
    }
}

/// Apply `new` to a task owned by `rq`, moving it between classes if the
/// policy demands it
fn change_attr(rq: &mut RunQueue, task: &TaskRef, new: SchedAttr) {
    let id = task.id();
    let old = task.attr();
    let Some(old_class) = rq.class_of(id) else {
        return;
    };
    let new_class = class_of(new.policy);
    let on_rq = rq.slot(id).map_or(OnRq::Off, |s| s.on_rq);
    let queued = on_rq != OnRq::Off;
    let running = rq.curr == id;
    // Runnable but parked until its replenishment timer
    let throttled = rq
        .slot(id)
        .and_then(|s| s.se.as_dl())
        .map_or(false, |dl| dl.is_throttled());

    if queued {
        rq.deactivate_task(id, DequeueFlags::SAVE);
    }
    task.set_attr(new);
    if old_class == new_class {
        let tun = rq.tun;
        if let Some(slot) = rq.slot_mut(id) {
            slot.se.refresh(&tun, &new);
        }
    } else {
        old_class.switched_from(rq, id);
        let se = new_class.task_fork(&rq.tun, &new);
        if let Some(slot) = rq.slot_mut(id) {
            slot.se = se;
        }
        new_class.switched_to(rq, id);
    }
    if queued {
        rq.activate_task(id, EnqueueFlags::RESTORE);
    } else if throttled && old_class != new_class && task.state().is_runnable() {
        rq.activate_task(id, EnqueueFlags::empty());
    }
    let queued = queued || rq.slot(id).map_or(false, |s| s.on_rq != OnRq::Off);

    if old_class == new_class {
        new_class.prio_changed(rq, id, &old);
    } else if running {
        rq.resched_curr();
    } else if queued {
        rq.check_preempt_curr(id, WakeFlags::empty());
    }
}
