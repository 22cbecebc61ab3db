//! Scheduling class dispatch
//!
//! The four classes form a closed set, so dispatch is a `match` over
//! [`SchedClass`] into zero-sized types implementing [`ClassOps`]. Every
//! class must provide every required operation; there is no table to leave
//! half filled.
//!
//! # Ordering
//! [`SchedClass::PRIORITY_ORDER`] is Deadline, RealTime, Fair, Idle. The
//! first class whose `pick_next` returns a task wins, and the derived `Ord`
//! follows the same order (smaller = more important).

use bitflags::bitflags;

use super::runqueue::RunQueue;
use crate::scheduler::config::Tunables;
use crate::scheduler::core::policy::SchedAttr;
use crate::scheduler::entity::SchedEntity;
use crate::scheduler::fair::FairClass;
use crate::scheduler::idle::IdleClass;
use crate::scheduler::realtime::deadline::DeadlineClass;
use crate::scheduler::realtime::RtClass;
use crate::scheduler::thread::{Task, TaskId};

bitflags! {
    /// Why a task is being enqueued
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Waking from sleep
        const WAKEUP   = 0x01;
        /// Re-inserted after a SAVE dequeue (attribute change)
        const RESTORE  = 0x02;
        /// Arriving through migration
        const MOVE     = 0x04;
        /// First enqueue of a new task
        const INITIAL  = 0x08;
        /// Woken onto a different CPU than it slept on
        const MIGRATED = 0x10;
    }
}

bitflags! {
    /// Why a task is being dequeued
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DequeueFlags: u32 {
        /// Going to sleep
        const SLEEP = 0x01;
        /// Temporary removal; keep vruntime absolute
        const SAVE  = 0x02;
        /// Leaving for another runqueue
        const MOVE  = 0x04;
    }
}

bitflags! {
    /// Wake-up context
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeFlags: u32 {
        /// Waker is about to sleep
        const SYNC     = 0x01;
        /// First wake-up of a forked task
        const FORK     = 0x02;
        const MIGRATED = 0x04;
    }
}

/// Scheduling class, most important first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedClass {
    Deadline,
    RealTime,
    Fair,
    Idle,
}

/// Operations every class implements
///
/// All operations run with the runqueue lock held and never fail; guards
/// against double insertion or removal live inside each implementation.
pub trait ClassOps {
    /// Insert into the ready structure; no-op when already queued
    fn enqueue(rq: &mut RunQueue, id: TaskId, flags: EnqueueFlags);
    /// Remove from the ready structure; no-op when not queued
    fn dequeue(rq: &mut RunQueue, id: TaskId, flags: DequeueFlags);
    /// Highest-priority RUNNING task of this class, removed from the ready structure
    fn pick_next(rq: &mut RunQueue) -> Option<TaskId>;
    /// `id` stops being current; re-queue if still runnable
    fn put_prev(rq: &mut RunQueue, id: TaskId);
    /// `id` is about to become current
    fn set_next(rq: &mut RunQueue, id: TaskId, first: bool);
    /// Periodic accounting for the current task
    fn task_tick(rq: &mut RunQueue, id: TaskId, queued: bool);
    /// `id` (same class as curr) became runnable; resched if it wins
    fn check_preempt_curr(rq: &mut RunQueue, id: TaskId, flags: WakeFlags);
    /// Charge runtime to the current task
    fn update_curr(rq: &mut RunQueue);
    /// Voluntary yield of the current task
    fn yield_task(rq: &mut RunQueue, id: TaskId);
    /// Fresh entity for a task entering this class
    fn task_fork(tun: &Tunables, attr: &SchedAttr) -> SchedEntity;

    fn task_dead(_rq: &mut RunQueue, _id: TaskId) {}
    fn switched_from(_rq: &mut RunQueue, _id: TaskId) {}
    fn switched_to(_rq: &mut RunQueue, _id: TaskId) {}
    fn prio_changed(_rq: &mut RunQueue, _id: TaskId, _old: &SchedAttr) {}

    /// Stay on the last CPU if allowed, else the first allowed online CPU
    fn select_task_rq(task: &Task, cpu_hint: usize, nr_cpus: usize, _flags: WakeFlags) -> usize {
        default_select_cpu(task, cpu_hint, nr_cpus)
    }

    /// Round-robin quantum in ns (0 when not round-robin)
    fn get_rr_interval(_rq: &RunQueue, _id: TaskId) -> u64 {
        0
    }
}

/// Affinity-respecting CPU choice shared by all classes
pub fn default_select_cpu(task: &Task, cpu_hint: usize, nr_cpus: usize) -> usize {
    let last = task.cpu();
    if last < nr_cpus && task.can_run_on(last) {
        return last;
    }
    if cpu_hint < nr_cpus && task.can_run_on(cpu_hint) {
        return cpu_hint;
    }
    task.affinity()
        .iter()
        .find(|&cpu| cpu < nr_cpus)
        .unwrap_or(last.min(nr_cpus.saturating_sub(1)))
}

macro_rules! dispatch {
    ($class:expr, $op:ident($($arg:expr),*)) => {
        match $class {
            SchedClass::Deadline => DeadlineClass::$op($($arg),*),
            SchedClass::RealTime => RtClass::$op($($arg),*),
            SchedClass::Fair => FairClass::$op($($arg),*),
            SchedClass::Idle => IdleClass::$op($($arg),*),
        }
    };
}

impl SchedClass {
    /// Pick order
    pub const PRIORITY_ORDER: [SchedClass; 4] =
        [SchedClass::Deadline, SchedClass::RealTime, SchedClass::Fair, SchedClass::Idle];

    /// Strictly more important than `other`
    pub fn outranks(self, other: SchedClass) -> bool {
        self < other
    }

    pub fn enqueue(self, rq: &mut RunQueue, id: TaskId, flags: EnqueueFlags) {
        dispatch!(self, enqueue(rq, id, flags))
    }

    pub fn dequeue(self, rq: &mut RunQueue, id: TaskId, flags: DequeueFlags) {
        dispatch!(self, dequeue(rq, id, flags))
    }

    pub fn pick_next(self, rq: &mut RunQueue) -> Option<TaskId> {
        dispatch!(self, pick_next(rq))
    }

    pub fn put_prev(self, rq: &mut RunQueue, id: TaskId) {
        dispatch!(self, put_prev(rq, id))
    }

    pub fn set_next(self, rq: &mut RunQueue, id: TaskId, first: bool) {
        dispatch!(self, set_next(rq, id, first))
    }

    pub fn task_tick(self, rq: &mut RunQueue, id: TaskId, queued: bool) {
        dispatch!(self, task_tick(rq, id, queued))
    }

    pub fn check_preempt_curr(self, rq: &mut RunQueue, id: TaskId, flags: WakeFlags) {
        dispatch!(self, check_preempt_curr(rq, id, flags))
    }

    pub fn update_curr(self, rq: &mut RunQueue) {
        dispatch!(self, update_curr(rq))
    }

    pub fn yield_task(self, rq: &mut RunQueue, id: TaskId) {
        dispatch!(self, yield_task(rq, id))
    }

    pub fn task_fork(self, tun: &Tunables, attr: &SchedAttr) -> SchedEntity {
        dispatch!(self, task_fork(tun, attr))
    }

    pub fn task_dead(self, rq: &mut RunQueue, id: TaskId) {
        dispatch!(self, task_dead(rq, id))
    }

    pub fn switched_from(self, rq: &mut RunQueue, id: TaskId) {
        dispatch!(self, switched_from(rq, id))
    }

    pub fn switched_to(self, rq: &mut RunQueue, id: TaskId) {
        dispatch!(self, switched_to(rq, id))
    }

    pub fn prio_changed(self, rq: &mut RunQueue, id: TaskId, old: &SchedAttr) {
        dispatch!(self, prio_changed(rq, id, old))
    }

    pub fn select_task_rq(self, task: &Task, cpu_hint: usize, nr_cpus: usize, flags: WakeFlags) -> usize {
        dispatch!(self, select_task_rq(task, cpu_hint, nr_cpus, flags))
    }

    pub fn get_rr_interval(self, rq: &RunQueue, id: TaskId) -> u64 {
        dispatch!(self, get_rr_interval(rq, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::core::affinity::CpuMask;

    #[test]
    fn test_priority_order() {
        assert!(SchedClass::Deadline.outranks(SchedClass::RealTime));
        assert!(SchedClass::RealTime.outranks(SchedClass::Fair));
        assert!(SchedClass::Fair.outranks(SchedClass::Idle));
        assert!(!SchedClass::Fair.outranks(SchedClass::Fair));
        let mut sorted = SchedClass::PRIORITY_ORDER;
        sorted.sort();
        assert_eq!(sorted, SchedClass::PRIORITY_ORDER);
    }

    #[test]
    fn test_select_stays_on_allowed_last_cpu() {
        let task = Task::new("t", SchedAttr::default());
        task.set_cpu(2);
        assert_eq!(default_select_cpu(&task, 0, 4), 2);
    }

    #[test]
    fn test_select_falls_back_to_first_allowed() {
        let task = Task::new("t", SchedAttr::default());
        task.set_cpu(2);
        let mut mask = CpuMask::empty();
        mask.set(1);
        mask.set(3);
        task.set_affinity_mask(mask);
        assert_eq!(default_select_cpu(&task, 0, 4), 1);
        assert_eq!(default_select_cpu(&task, 3, 4), 3);
    }

    #[test]
    fn test_enqueue_flags_are_distinct() {
        let all = EnqueueFlags::WAKEUP
            | EnqueueFlags::RESTORE
            | EnqueueFlags::MOVE
            | EnqueueFlags::INITIAL
            | EnqueueFlags::MIGRATED;
        assert_eq!(all.bits().count_ones(), 5);
        assert!(!(DequeueFlags::SLEEP | DequeueFlags::MOVE).contains(DequeueFlags::SAVE));
    }
}
