//! Wait Queue
//!
//! Tasks park here until an event occurs. Sleeping is the usual two-step:
//! `prepare_to_wait` queues the task and sets its sleeping state, the caller
//! re-checks its condition, then calls `schedule()`. A wake-up that lands
//! between the check and the switch finds the task already queued and
//! flips it back to `Running`, so the voluntary `schedule()` keeps it on the
//! runqueue.
//!
//! Non-exclusive waiters sit at the head and are all woken; exclusive
//! waiters sit at the tail and are woken `nr` at a time.
//!
//! On a platform whose `switch_to` returns before the sleeper is resumed,
//! a wait reports [`WaitResult::Pending`]. Calling the same wait again once
//! the task runs continues it with its original deadline.

use alloc::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::scheduler::core::class::WakeFlags;
use crate::scheduler::switch::Platform;
use crate::scheduler::thread::{TaskId, TaskRef, TaskState};
use crate::scheduler::Scheduler;

struct Waiter {
    task: TaskRef,
    exclusive: bool,
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Condition observed; ns left of the timeout (0 for untimed waits)
    Done(u64),
    /// The timeout elapsed first
    TimedOut,
    /// Interruptible sleeper woken while the condition was still false
    Interrupted,
    /// Still asleep when `schedule()` returned
    Pending,
}

impl WaitResult {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// A queue of waiting tasks
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    /// Deadline of each wait that returned `Pending`
    parked: Mutex<BTreeMap<TaskId, Option<u64>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            parked: Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue `task` unless it is already there
    pub fn add(&self, task: &TaskRef, exclusive: bool) {
        let mut waiters = self.waiters.lock();
        Self::add_locked(&mut waiters, task, exclusive);
    }

    fn add_locked(waiters: &mut VecDeque<Waiter>, task: &TaskRef, exclusive: bool) {
        if waiters.iter().any(|w| w.task.id() == task.id()) {
            return;
        }
        let waiter = Waiter { task: task.clone(), exclusive };
        if exclusive {
            waiters.push_back(waiter);
        } else {
            waiters.push_front(waiter);
        }
    }

    /// Drop `id` from the queue; false if it was not queued
    pub fn remove(&self, id: TaskId) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|w| w.task.id() == id) {
            Some(pos) => {
                waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.waiters.lock().iter().any(|w| w.task.id() == id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Queue the current task of `cpu` and put it in `state`.
    ///
    /// Returns the task, or `None` when `cpu` only runs its idle task.
    pub fn prepare_to_wait<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        state: TaskState,
    ) -> Option<TaskRef> {
        self.prepare(sched, cpu, state, false)
    }

    /// Like [`WaitQueue::prepare_to_wait`], woken one at a time
    pub fn prepare_to_wait_exclusive<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        state: TaskState,
    ) -> Option<TaskRef> {
        self.prepare(sched, cpu, state, true)
    }

    fn prepare<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        state: TaskState,
        exclusive: bool,
    ) -> Option<TaskRef> {
        let task = sched.current(cpu).filter(|t| !t.is_idle())?;
        let mut waiters = self.waiters.lock();
        Self::add_locked(&mut waiters, &task, exclusive);
        task.set_state(state);
        Some(task)
    }

    /// Undo `prepare_to_wait` once the caller is done waiting
    pub fn finish_wait(&self, task: &TaskRef) {
        if task.state().is_sleeping() {
            task.set_state(TaskState::Running);
        }
        self.remove(task.id());
    }

    /// Wake every non-exclusive waiter and up to `nr_exclusive` exclusive
    /// ones (0 means all) whose state satisfies `wakes`. Woken tasks leave
    /// the queue.
    fn wake_common<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        mut nr_exclusive: usize,
        wakes: fn(TaskState) -> bool,
    ) -> usize {
        let mut waiters = self.waiters.lock();
        let mut woken = 0;
        let mut i = 0;
        while i < waiters.len() {
            let exclusive = waiters[i].exclusive;
            if !sched.try_to_wake_up_state(&waiters[i].task, WakeFlags::empty(), wakes) {
                i += 1;
                continue;
            }
            waiters.remove(i);
            woken += 1;
            if exclusive && nr_exclusive > 0 {
                nr_exclusive -= 1;
                if nr_exclusive == 0 {
                    break;
                }
            }
        }
        woken
    }

    /// Wake all non-exclusive waiters and one exclusive waiter
    pub fn wake_up<P: Platform>(&self, sched: &Scheduler<P>) -> usize {
        self.wake_common(sched, 1, TaskState::is_sleeping)
    }

    /// Wake all non-exclusive waiters and `nr` exclusive ones
    pub fn wake_up_nr<P: Platform>(&self, sched: &Scheduler<P>, nr: usize) -> usize {
        if nr == 0 {
            return 0;
        }
        self.wake_common(sched, nr, TaskState::is_sleeping)
    }

    pub fn wake_up_all<P: Platform>(&self, sched: &Scheduler<P>) -> usize {
        self.wake_common(sched, 0, TaskState::is_sleeping)
    }

    /// Like [`WaitQueue::wake_up`], skipping uninterruptible sleepers
    pub fn wake_up_interruptible<P: Platform>(&self, sched: &Scheduler<P>) -> usize {
        self.wake_common(sched, 1, |state| state == TaskState::Interruptible)
    }

    /// Sleep uninterruptibly on this queue until `cond` holds.
    ///
    /// Returns false only if the task is still asleep when `schedule()`
    /// comes back; it is then left queued.
    pub fn wait_event<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        cond: impl FnMut() -> bool,
    ) -> bool {
        self.wait_common(sched, cpu, false, TaskState::Uninterruptible, None, cond)
            .is_done()
    }

    /// Like [`WaitQueue::wait_event`], but any wake-up that finds `cond`
    /// false ends the wait with [`WaitResult::Interrupted`]
    pub fn wait_event_interruptible<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        cond: impl FnMut() -> bool,
    ) -> WaitResult {
        self.wait_common(sched, cpu, false, TaskState::Interruptible, None, cond)
    }

    /// Uninterruptible wait bounded by `timeout_ns`
    pub fn wait_event_timeout<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        timeout_ns: u64,
        cond: impl FnMut() -> bool,
    ) -> WaitResult {
        self.wait_common(sched, cpu, false, TaskState::Uninterruptible, Some(timeout_ns), cond)
    }

    pub fn wait_event_interruptible_timeout<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        timeout_ns: u64,
        cond: impl FnMut() -> bool,
    ) -> WaitResult {
        self.wait_common(sched, cpu, false, TaskState::Interruptible, Some(timeout_ns), cond)
    }

    /// The loop behind every `wait_event*` variant.
    ///
    /// The condition wins over the timeout, and the timeout wins over an
    /// interruption.
    pub(crate) fn wait_common<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        exclusive: bool,
        state: TaskState,
        timeout_ns: Option<u64>,
        mut cond: impl FnMut() -> bool,
    ) -> WaitResult {
        let Some(task) = sched.current(cpu).filter(|t| !t.is_idle()) else {
            return if cond() { WaitResult::Done(timeout_ns.unwrap_or(0)) } else { WaitResult::Pending };
        };
        let now = sched.platform().now_ns();
        // Running again after a `Pending` return means something woke it
        let (deadline, mut woken) = match self.parked.lock().remove(&task.id()) {
            Some(deadline) => (deadline, true),
            None => (timeout_ns.map(|t| now.saturating_add(t)), false),
        };

        let result = loop {
            let left = deadline.map_or(0, |d| d.saturating_sub(sched.platform().now_ns()));
            if cond() {
                break WaitResult::Done(left);
            }
            if deadline.is_some() && left == 0 {
                break WaitResult::TimedOut;
            }
            if woken && state == TaskState::Interruptible {
                break WaitResult::Interrupted;
            }

            self.prepare(sched, cpu, state, exclusive);
            if cond() {
                break WaitResult::Done(left);
            }
            match deadline {
                Some(d) => {
                    sched.schedule_until(cpu, d);
                }
                None => sched.schedule(cpu),
            }
            if !sched.current(cpu).map_or(false, |c| c.id() == task.id()) {
                self.parked.lock().insert(task.id(), deadline);
                return WaitResult::Pending;
            }
            woken = true;
        };
        self.finish_wait(&task);
        result
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::config::SchedConfig;
    use crate::scheduler::core::policy::SchedAttr;
    use crate::scheduler::switch::SimPlatform;
    use crate::scheduler::thread::Task;

    fn sched() -> Scheduler<SimPlatform> {
        Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap()
    }

    fn parked(s: &Scheduler<SimPlatform>, state: TaskState) -> TaskRef {
        let task = Task::new("waiter", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        task.set_state(state);
        task
    }

    #[test]
    fn test_exclusive_waiters_woken_one_at_a_time() {
        let s = sched();
        let wq = WaitQueue::new();
        let shared = parked(&s, TaskState::Interruptible);
        let ex1 = parked(&s, TaskState::Interruptible);
        let ex2 = parked(&s, TaskState::Interruptible);
        wq.add(&ex1, true);
        wq.add(&ex2, true);
        wq.add(&shared, false);

        assert_eq!(wq.wake_up(&s), 2);
        assert_eq!(shared.state(), TaskState::Running);
        assert_eq!(ex1.state(), TaskState::Running);
        assert_eq!(ex2.state(), TaskState::Interruptible);
        assert!(wq.contains(ex2.id()));

        assert_eq!(wq.wake_up_all(&s), 1);
        assert!(wq.is_empty());
    }

    #[test]
    fn test_interruptible_wake_skips_uninterruptible() {
        let s = sched();
        let wq = WaitQueue::new();
        let deep = parked(&s, TaskState::Uninterruptible);
        let light = parked(&s, TaskState::Interruptible);
        wq.add(&deep, false);
        wq.add(&light, false);

        assert_eq!(wq.wake_up_interruptible(&s), 1);
        assert_eq!(deep.state(), TaskState::Uninterruptible);
        assert_eq!(light.state(), TaskState::Running);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn test_wake_up_nr() {
        let s = sched();
        let wq = WaitQueue::new();
        let tasks: alloc::vec::Vec<_> = (0..4).map(|_| parked(&s, TaskState::Interruptible)).collect();
        for t in &tasks {
            wq.add(t, true);
        }
        assert_eq!(wq.wake_up_nr(&s, 0), 0);
        assert_eq!(wq.wake_up_nr(&s, 3), 3);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn test_wait_event_sleeps_then_returns() {
        let s = sched();
        let task = Task::new("sleeper", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        s.schedule(0);
        assert_eq!(s.current(0).unwrap().id(), task.id());

        let wq = WaitQueue::new();
        assert!(!wq.wait_event(&s, 0, || false));
        assert_eq!(task.state(), TaskState::Uninterruptible);
        assert!(s.current(0).unwrap().is_idle());
        assert_eq!(s.nr_runnable(0), 0);

        assert_eq!(wq.wake_up(&s), 1);
        s.schedule(0);
        assert_eq!(s.current(0).unwrap().id(), task.id());
        assert!(wq.wait_event(&s, 0, || true));
        assert_eq!(task.state(), TaskState::Running);
    }

    fn running(s: &Scheduler<SimPlatform>, name: &str) -> TaskRef {
        let task = Task::new(name, SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        task
    }

    fn tick(s: &Scheduler<SimPlatform>, ns: u64) {
        s.platform().advance(ns);
        s.scheduler_tick(0);
        s.check_preempt(0);
    }

    #[test]
    fn test_timeout_wakes_waiter() {
        let s = sched();
        let task = running(&s, "timed");
        s.schedule(0);

        let wq = WaitQueue::new();
        assert_eq!(wq.wait_event_timeout(&s, 0, 5_000_000, || false), WaitResult::Pending);
        assert_eq!(task.state(), TaskState::Uninterruptible);
        assert!(s.current(0).unwrap().is_idle());

        for _ in 0..4 {
            tick(&s, 1_000_000);
        }
        assert!(s.current(0).unwrap().is_idle());
        tick(&s, 1_000_000);
        assert_eq!(s.current(0).unwrap().id(), task.id());

        // The resumed wait sees its deadline has passed
        assert_eq!(wq.wait_event_timeout(&s, 0, 5_000_000, || false), WaitResult::TimedOut);
        assert!(wq.is_empty());
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_condition_before_timeout_reports_time_left() {
        let s = sched();
        let task = running(&s, "waiter");
        s.schedule(0);

        let ready = core::sync::atomic::AtomicBool::new(false);
        let cond = || ready.load(core::sync::atomic::Ordering::SeqCst);
        let wq = WaitQueue::new();
        assert_eq!(wq.wait_event_interruptible_timeout(&s, 0, 10_000_000, cond), WaitResult::Pending);

        s.platform().advance(4_000_000);
        ready.store(true, core::sync::atomic::Ordering::SeqCst);
        assert_eq!(wq.wake_up(&s), 1);
        s.check_preempt(0);
        assert_eq!(s.current(0).unwrap().id(), task.id());
        assert_eq!(wq.wait_event_interruptible_timeout(&s, 0, 10_000_000, cond), WaitResult::Done(6_000_000));

        // Its timer was cancelled by the wake-up
        s.sleep_current(0, TaskState::Interruptible).unwrap();
        for _ in 0..10 {
            tick(&s, 1_000_000);
        }
        assert_eq!(task.state(), TaskState::Interruptible);
    }

    #[test]
    fn test_interruptible_wake_releases_only_interruptible_wait() {
        let s = sched();
        let deep = running(&s, "deep");
        let light = running(&s, "light");
        s.schedule(0);
        assert_eq!(s.current(0).unwrap().id(), deep.id());

        let wq = WaitQueue::new();
        assert_eq!(wq.wait_event_timeout(&s, 0, 50_000_000, || false), WaitResult::Pending);
        assert_eq!(s.current(0).unwrap().id(), light.id());
        assert_eq!(wq.wait_event_interruptible(&s, 0, || false), WaitResult::Pending);
        assert!(s.current(0).unwrap().is_idle());

        assert_eq!(wq.wake_up_interruptible(&s), 1);
        assert_eq!(deep.state(), TaskState::Uninterruptible);
        assert_eq!(light.state(), TaskState::Running);

        s.check_preempt(0);
        assert_eq!(s.current(0).unwrap().id(), light.id());
        assert_eq!(wq.wait_event_interruptible(&s, 0, || false), WaitResult::Interrupted);
        assert_eq!(light.state(), TaskState::Running);
        assert!(wq.contains(deep.id()));
        assert!(!wq.contains(light.id()));
    }

    #[test]
    fn test_uninterruptible_wait_sleeps_again_on_spurious_wake() {
        let s = sched();
        let task = running(&s, "sleeper");
        s.schedule(0);

        let wq = WaitQueue::new();
        assert!(!wq.wait_event(&s, 0, || false));
        assert_eq!(wq.wake_up(&s), 1);
        s.check_preempt(0);
        assert_eq!(s.current(0).unwrap().id(), task.id());

        assert!(!wq.wait_event(&s, 0, || false));
        assert_eq!(task.state(), TaskState::Uninterruptible);
        assert!(wq.contains(task.id()));
    }

    #[test]
    fn test_finish_wait_dequeues() {
        let s = sched();
        let task = Task::new("t", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        s.schedule(0);
        let wq = WaitQueue::new();
        let waiting = wq.prepare_to_wait(&s, 0, TaskState::Interruptible).unwrap();
        assert_eq!(waiting.id(), task.id());
        assert!(wq.contains(task.id()));
        wq.finish_wait(&waiting);
        assert!(wq.is_empty());
        assert_eq!(task.state(), TaskState::Running);
    }
}
