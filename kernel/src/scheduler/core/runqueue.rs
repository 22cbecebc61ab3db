//! Run Queue - Per-CPU scheduling state
//!
//! Each CPU owns one [`RunQueue`] behind its own lock. The runqueue holds
//! the scheduling slot of every task assigned to the CPU (an arena keyed by
//! task id) plus one ready structure per class. Ready structures only store
//! ids, so a task can never be reachable from two runqueues at once.
//!
//! # Counting
//! `nr_running` counts entities sitting in a ready structure. The current
//! task is outside every structure while it runs and is not counted;
//! [`RunQueue::nr_runnable`] adds it back for balancing decisions.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use super::class::{DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
use super::statistics::RqStats;
use crate::scheduler::config::Tunables;
use crate::scheduler::entity::{OnRq, SchedEntity, TaskSlot};
use crate::scheduler::fair::FairRq;
use crate::scheduler::realtime::deadline::DlRq;
use crate::scheduler::realtime::RtRq;
use crate::scheduler::thread::{TaskId, TaskRef, TaskStats};

/// Per-CPU runqueue
pub struct RunQueue {
    pub cpu: usize,
    /// Ticks processed on this CPU
    pub clock: u64,
    /// Task clock in ns, monotonic
    pub clock_task: u64,
    /// Task owning the CPU; the idle task when nothing else runs
    pub curr: TaskId,
    pub idle: TaskId,
    /// Entities in ready structures (curr excluded)
    pub nr_running: usize,
    pub cfs: FairRq,
    pub rt: RtRq,
    pub dl: DlRq,
    pub(crate) slots: BTreeMap<TaskId, TaskSlot>,
    /// `schedule_timeout` sleepers by expiry
    pub(crate) sleep_timers: BTreeSet<(u64, TaskId)>,
    pub stats: RqStats,
    /// Tunables snapshot, refreshed every tick
    pub tun: Tunables,
    need_resched: bool,
}

impl RunQueue {
    /// Runqueue whose current task is `idle`
    pub fn new(cpu: usize, idle: TaskRef, tun: Tunables) -> Self {
        let idle_id = idle.id();
        let mut slot = TaskSlot::new(idle, SchedEntity::Idle);
        slot.on_rq = OnRq::Current;
        let mut slots = BTreeMap::new();
        slots.insert(idle_id, slot);

        Self {
            cpu,
            clock: 0,
            clock_task: 0,
            curr: idle_id,
            idle: idle_id,
            nr_running: 0,
            cfs: FairRq::new(),
            rt: RtRq::new(),
            dl: DlRq::new(),
            slots,
            sleep_timers: BTreeSet::new(),
            stats: RqStats::default(),
            tun,
            need_resched: false,
        }
    }

    /// Move the task clock forward; never backwards
    pub fn update_clock(&mut self, now: u64) {
        if now > self.clock_task {
            self.clock_task = now;
        }
    }

    /// Tick bookkeeping: tick counter plus task clock
    pub fn tick_clock(&mut self, now: u64) {
        self.clock += 1;
        self.stats.nr_ticks += 1;
        self.update_clock(now);
    }

    /// Ask for a reschedule of this CPU
    pub fn resched_curr(&mut self) {
        if !self.need_resched {
            self.need_resched = true;
            self.stats.nr_preemptions += 1;
        }
    }

    pub fn resched_pending(&self) -> bool {
        self.need_resched
    }

    /// Consume the pending reschedule request
    pub fn take_resched(&mut self) -> bool {
        core::mem::take(&mut self.need_resched)
    }

    // ========================================================================
    // Slot arena
    // ========================================================================

    pub fn slot(&self, id: TaskId) -> Option<&TaskSlot> {
        self.slots.get(&id)
    }

    pub fn slot_mut(&mut self, id: TaskId) -> Option<&mut TaskSlot> {
        self.slots.get_mut(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskRef> {
        self.slots.get(&id).map(|s| &s.task)
    }

    pub fn curr_task(&self) -> Option<TaskRef> {
        self.task(self.curr).cloned()
    }

    /// Ids of every task owned by this CPU, idle included
    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.slots.keys().copied()
    }

    /// Tasks owned by this CPU, idle included
    pub fn nr_tasks(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn insert_slot(&mut self, slot: TaskSlot) -> bool {
        let id = slot.task.id();
        if self.slots.contains_key(&id) {
            return false;
        }
        slot.task.set_cpu(self.cpu);
        self.slots.insert(id, slot);
        true
    }

    /// Drop a slot that is off every ready structure
    pub(crate) fn remove_slot(&mut self, id: TaskId) -> Option<TaskSlot> {
        if id == self.curr || id == self.idle {
            return None;
        }
        match self.slots.get(&id) {
            Some(slot) if slot.on_rq == OnRq::Off => {}
            _ => return None,
        }
        self.cancel_sleep_timer(id);
        self.slots.remove(&id)
    }

    pub fn class_of(&self, id: TaskId) -> Option<SchedClass> {
        self.slots.get(&id).map(TaskSlot::class)
    }

    pub fn curr_class(&self) -> SchedClass {
        self.class_of(self.curr).unwrap_or(SchedClass::Idle)
    }

    /// The current task, if it is executing in `class`
    pub fn curr_in(&self, class: SchedClass) -> Option<TaskId> {
        let slot = self.slots.get(&self.curr)?;
        (slot.on_rq == OnRq::Current && slot.class() == class).then_some(self.curr)
    }

    // ========================================================================
    // Class plumbing
    // ========================================================================

    pub fn activate_task(&mut self, id: TaskId, flags: EnqueueFlags) {
        if let Some(class) = self.class_of(id) {
            class.enqueue(self, id, flags);
        }
    }

    pub fn deactivate_task(&mut self, id: TaskId, flags: DequeueFlags) {
        if let Some(class) = self.class_of(id) {
            class.dequeue(self, id, flags);
        }
    }

    /// `id` just became runnable here; preempt curr if it should
    pub fn check_preempt_curr(&mut self, id: TaskId, flags: WakeFlags) {
        if id == self.curr {
            return;
        }
        let (Some(class), Some(curr_class)) = (self.class_of(id), self.class_of(self.curr)) else {
            return;
        };
        if class == curr_class {
            class.check_preempt_curr(self, id, flags);
        } else if class.outranks(curr_class) {
            self.resched_curr();
        }
    }

    /// Charge runtime to the current task through its class
    pub fn update_curr(&mut self) {
        let class = self.curr_class();
        class.update_curr(self);
    }

    /// First task offered by the classes in priority order
    pub fn pick_next_task(&mut self) -> TaskId {
        for class in SchedClass::PRIORITY_ORDER {
            if let Some(id) = class.pick_next(self) {
                return id;
            }
        }
        self.idle
    }

    pub fn put_prev_task(&mut self, id: TaskId) {
        if let Some(class) = self.class_of(id) {
            class.put_prev(self, id);
        }
    }

    pub fn set_next_task(&mut self, id: TaskId) {
        if let Some(class) = self.class_of(id) {
            class.set_next(self, id, true);
        }
    }

    /// Reset the exec clock of a task becoming current
    pub(crate) fn start_exec(&mut self, id: TaskId) {
        let now = self.clock_task;
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.exec.start(now);
        }
    }

    /// Charge wall time since the last accounting point to `id`
    pub(crate) fn account_exec(&mut self, id: TaskId) -> u64 {
        let now = self.clock_task;
        let Some(slot) = self.slots.get_mut(&id) else {
            return 0;
        };
        let delta = slot.exec.advance(now);
        if delta > 0 {
            slot.task.stats().add_exec(delta);
            self.stats.exec_clock += delta;
        }
        delta
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Queued entities plus a running non-idle task
    pub fn nr_runnable(&self) -> usize {
        let running = self.curr != self.idle
            && self.slots.get(&self.curr).map_or(false, |s| s.on_rq == OnRq::Current);
        self.nr_running + running as usize
    }

    /// Runnable deadline tasks waiting for replenishment
    pub fn nr_throttled(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.is_runnable())
            .filter(|s| s.se.as_dl().map_or(false, |dl| dl.is_throttled()))
            .count()
    }

    // ========================================================================
    // Sleep timers
    // ========================================================================

    pub(crate) fn arm_sleep_timer(&mut self, expires: u64, id: TaskId) {
        self.cancel_sleep_timer(id);
        self.sleep_timers.insert((expires, id));
    }

    pub(crate) fn cancel_sleep_timer(&mut self, id: TaskId) {
        self.sleep_timers.retain(|&(_, t)| t != id);
    }

    /// Sleepers whose timeout expired at `now`
    pub(crate) fn take_expired_sleepers(&mut self, now: u64) -> Vec<TaskRef> {
        let mut expired = Vec::new();
        while let Some(&(expires, id)) = self.sleep_timers.first() {
            if expires > now {
                break;
            }
            self.sleep_timers.remove(&(expires, id));
            if let Some(task) = self.task(id) {
                expired.push(task.clone());
            }
        }
        expired
    }
}

/// Move `id` from `src` to `dst`, both locked by the caller.
///
/// The current task of `src` never moves. A queued task is dequeued with
/// MOVE and re-enqueued on arrival; armed timers travel with the slot.
pub(crate) fn move_task(src: &mut RunQueue, dst: &mut RunQueue, id: TaskId) -> bool {
    if id == src.curr || id == src.idle || !src.contains(id) {
        return false;
    }
    let queued = src.slots.get(&id).map_or(false, |s| s.on_rq == OnRq::Queued);
    if queued {
        src.deactivate_task(id, DequeueFlags::MOVE);
    }

    let Some(slot) = src.slots.remove(&id) else {
        return false;
    };
    if let Some(expires) = slot.se.as_dl().and_then(|dl| dl.timer) {
        src.dl.cancel_timer(expires, id);
        dst.dl.arm_timer(expires, id);
    }
    let sleeper = src.sleep_timers.iter().find(|&&(_, t)| t == id).copied();
    if let Some((expires, _)) = sleeper {
        src.sleep_timers.remove(&(expires, id));
        dst.sleep_timers.insert((expires, id));
    }

    slot.task.set_cpu(dst.cpu);
    TaskStats::bump(&slot.task.stats().nr_migrations);
    dst.slots.insert(id, slot);
    if queued {
        dst.activate_task(id, EnqueueFlags::MOVE);
    }

    src.stats.nr_migrations_out += 1;
    dst.stats.nr_migrations_in += 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::core::policy::SchedAttr;
    use crate::scheduler::entity::class_of;
    use crate::scheduler::thread::{Task, TaskState};

    fn rq(cpu: usize) -> RunQueue {
        RunQueue::new(cpu, Task::new_idle(cpu), Tunables::DEFAULT)
    }

    fn add(rq: &mut RunQueue, attr: SchedAttr) -> TaskRef {
        let task = Task::new("t", attr);
        let se = class_of(attr.policy).task_fork(&rq.tun, &attr);
        assert!(rq.insert_slot(TaskSlot::new(task.clone(), se)));
        rq.activate_task(task.id(), EnqueueFlags::INITIAL);
        task
    }

    #[test]
    fn test_empty_rq_picks_idle() {
        let mut rq = rq(0);
        rq.put_prev_task(rq.curr);
        assert_eq!(rq.pick_next_task(), rq.idle);
        assert_eq!(rq.nr_runnable(), 0);
    }

    #[test]
    fn test_class_order_on_pick() {
        let mut rq = rq(0);
        let fair = add(&mut rq, SchedAttr::normal(0));
        let rt = add(&mut rq, SchedAttr::fifo(10));
        assert_eq!(rq.nr_running, 2);
        rq.put_prev_task(rq.curr);
        assert_eq!(rq.pick_next_task(), rt.id());
        assert_eq!(rq.nr_running, 1);
        assert_eq!(rq.slot(rt.id()).unwrap().on_rq, OnRq::Current);
        rq.curr = rt.id();
        assert_eq!(rq.nr_runnable(), 2);
        rt.set_state(TaskState::Interruptible);
        rq.deactivate_task(rt.id(), DequeueFlags::SLEEP);
        assert_eq!(rq.pick_next_task(), fair.id());
    }

    #[test]
    fn test_cross_class_preemption() {
        let mut rq = rq(0);
        let fair = add(&mut rq, SchedAttr::normal(0));
        rq.put_prev_task(rq.curr);
        let id = rq.pick_next_task();
        rq.curr = id;
        assert_eq!(id, fair.id());
        let rt = add(&mut rq, SchedAttr::fifo(50));
        rq.check_preempt_curr(rt.id(), WakeFlags::empty());
        assert!(rq.take_resched());
        assert!(!rq.resched_pending());
    }

    #[test]
    fn test_move_task_keeps_counts() {
        let mut a = rq(0);
        let mut b = rq(1);
        let t = add(&mut a, SchedAttr::normal(0));
        assert!(move_task(&mut a, &mut b, t.id()));
        assert_eq!(a.nr_running, 0);
        assert_eq!(b.nr_running, 1);
        assert_eq!(t.cpu(), 1);
        assert_eq!(t.stats().snapshot().nr_migrations, 1);
        assert!(!move_task(&mut a, &mut b, t.id()));
    }

    #[test]
    fn test_curr_never_moves() {
        let mut a = rq(0);
        let mut b = rq(1);
        let idle = a.idle;
        assert!(!move_task(&mut a, &mut b, idle));
    }

    #[test]
    fn test_sleep_timers_expire_in_order() {
        let mut rq = rq(0);
        let t1 = add(&mut rq, SchedAttr::normal(0));
        let t2 = add(&mut rq, SchedAttr::normal(0));
        rq.arm_sleep_timer(200, t1.id());
        rq.arm_sleep_timer(100, t2.id());
        let expired = rq.take_expired_sleepers(150);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), t2.id());
        rq.cancel_sleep_timer(t1.id());
        assert!(rq.take_expired_sleepers(1_000).is_empty());
    }
}
