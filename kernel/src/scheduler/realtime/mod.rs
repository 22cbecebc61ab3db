//! Real-time scheduling support
//!
//! FIFO and round-robin share one class: 100 FIFO lists, one per priority
//! level, plus a presence bitmap. A task never loses the CPU to a task of
//! equal priority except through its own yield or, for round-robin, quantum
//! expiry. Preempted tasks go back to the head of their list.

pub mod deadline;
pub mod priorities;

pub use deadline::{DeadlineClass, DlRq};
pub use priorities::{PrioBitmap, RtPriority};

use alloc::collections::VecDeque;

use crate::scheduler::config::Tunables;
use crate::scheduler::core::class::{ClassOps, DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
use crate::scheduler::core::policy::{SchedAttr, SchedPolicy, MAX_RT_PRIO};
use crate::scheduler::core::runqueue::RunQueue;
use crate::scheduler::entity::{OnRq, RtEntity, SchedEntity};
use crate::scheduler::thread::TaskId;

/// Real-time part of a runqueue
pub struct RtRq {
    queues: [VecDeque<TaskId>; MAX_RT_PRIO],
    bitmap: PrioBitmap,
    /// Queued RT entities
    pub rt_nr_running: usize,
}

impl RtRq {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            bitmap: PrioBitmap::new(),
            rt_nr_running: 0,
        }
    }

    fn push(&mut self, prio: RtPriority, id: TaskId, head: bool) {
        let queue = &mut self.queues[prio.index()];
        if head {
            queue.push_front(id);
        } else {
            queue.push_back(id);
        }
        self.bitmap.set(prio.index());
        self.rt_nr_running += 1;
    }

    fn remove(&mut self, prio: RtPriority, id: TaskId) -> bool {
        let queue = &mut self.queues[prio.index()];
        let Some(pos) = queue.iter().position(|&t| t == id) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.bitmap.clear(prio.index());
        }
        self.rt_nr_running -= 1;
        true
    }

    /// Most important non-empty level
    pub fn highest_prio(&self) -> Option<RtPriority> {
        self.bitmap.first().map(|p| RtPriority::new(p as u8))
    }

    /// Tasks queued at `prio`, in run order
    pub fn queued_at(&self, prio: RtPriority) -> impl Iterator<Item = TaskId> + '_ {
        self.queues[prio.index()].iter().copied()
    }

    pub fn nr_queued_at(&self, prio: RtPriority) -> usize {
        self.queues[prio.index()].len()
    }
}

impl Default for RtRq {
    fn default() -> Self {
        Self::new()
    }
}

fn rt_entity(rq: &RunQueue, id: TaskId) -> Option<&RtEntity> {
    rq.slots.get(&id).and_then(|s| s.se.as_rt())
}

fn rt_entity_mut(rq: &mut RunQueue, id: TaskId) -> Option<&mut RtEntity> {
    rq.slots.get_mut(&id).and_then(|s| s.se.as_rt_mut())
}

/// Real-time scheduling class
pub struct RtClass;

impl ClassOps for RtClass {
    fn enqueue(rq: &mut RunQueue, id: TaskId, _flags: EnqueueFlags) {
        let is_curr = rq.curr == id;
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        if slot.on_rq != OnRq::Off {
            return;
        }
        let Some(rt) = slot.se.as_rt() else {
            return;
        };
        if is_curr {
            slot.on_rq = OnRq::Current;
        } else {
            rq.rt.push(rt.prio, id, false);
            slot.on_rq = OnRq::Queued;
            rq.nr_running += 1;
        }
    }

    fn dequeue(rq: &mut RunQueue, id: TaskId, _flags: DequeueFlags) {
        Self::update_curr(rq);
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        let Some(rt) = slot.se.as_rt() else {
            return;
        };
        match slot.on_rq {
            OnRq::Off => return,
            OnRq::Queued => {
                if rq.rt.remove(rt.prio, id) {
                    rq.nr_running -= 1;
                }
            }
            OnRq::Current => {}
        }
        slot.on_rq = OnRq::Off;
    }

    fn pick_next(rq: &mut RunQueue) -> Option<TaskId> {
        let view: &RunQueue = rq;
        let runnable = |id: TaskId| view.slots.get(&id).map_or(false, |s| s.is_runnable());
        let (prio, id) = view.rt.bitmap.iter().find_map(|p| {
            view.rt.queues[p]
                .iter()
                .copied()
                .find(|&id| runnable(id))
                .map(|id| (RtPriority::new(p as u8), id))
        })?;

        rq.rt.remove(prio, id);
        rq.nr_running -= 1;
        if let Some(slot) = rq.slots.get_mut(&id) {
            slot.on_rq = OnRq::Current;
        }
        Some(id)
    }

    fn put_prev(rq: &mut RunQueue, id: TaskId) {
        Self::update_curr(rq);
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        if slot.on_rq != OnRq::Current {
            return;
        }
        let Some(rt) = slot.se.as_rt_mut() else {
            return;
        };
        // Preempted tasks resume first; expired or yielding ones wait their turn
        let head = !core::mem::take(&mut rt.requeue_tail);
        rq.rt.push(rt.prio, id, head);
        slot.on_rq = OnRq::Queued;
        rq.nr_running += 1;
    }

    fn set_next(rq: &mut RunQueue, id: TaskId, _first: bool) {
        rq.start_exec(id);
    }

    fn task_tick(rq: &mut RunQueue, id: TaskId, _queued: bool) {
        Self::update_curr(rq);
        let tick = rq.tun.tick_ns;
        let quantum = rq.tun.rr_timeslice_ns;
        let Some(rt) = rt_entity_mut(rq, id) else {
            return;
        };
        if !rt.round_robin {
            return;
        }
        rt.time_slice = rt.time_slice.saturating_sub(tick);
        if rt.time_slice > 0 {
            return;
        }
        rt.time_slice = quantum;
        let prio = rt.prio;
        if rq.rt.nr_queued_at(prio) > 0 {
            if let Some(rt) = rt_entity_mut(rq, id) {
                rt.requeue_tail = true;
            }
            rq.resched_curr();
        }
    }

    fn check_preempt_curr(rq: &mut RunQueue, id: TaskId, _flags: WakeFlags) {
        let waker = rt_entity(rq, id).map(|rt| rt.prio);
        let curr = rt_entity(rq, rq.curr).map(|rt| rt.prio);
        if let (Some(waker), Some(curr)) = (waker, curr) {
            if waker.outranks(&curr) {
                rq.resched_curr();
            }
        }
    }

    fn update_curr(rq: &mut RunQueue) {
        if let Some(id) = rq.curr_in(SchedClass::RealTime) {
            rq.account_exec(id);
        }
    }

    fn yield_task(rq: &mut RunQueue, id: TaskId) {
        if let Some(rt) = rt_entity_mut(rq, id) {
            rt.requeue_tail = true;
            rq.resched_curr();
        }
    }

    fn task_fork(tun: &Tunables, attr: &SchedAttr) -> SchedEntity {
        SchedEntity::RealTime(RtEntity {
            prio: RtPriority::new(attr.rt_priority),
            round_robin: attr.policy == SchedPolicy::RoundRobin,
            time_slice: tun.rr_timeslice_ns,
            requeue_tail: false,
        })
    }

    fn prio_changed(rq: &mut RunQueue, id: TaskId, old: &SchedAttr) {
        let Some(slot) = rq.slots.get(&id) else {
            return;
        };
        let Some(prio) = slot.se.as_rt().map(|rt| rt.prio) else {
            return;
        };
        let on_rq = slot.on_rq;
        if rq.curr == id {
            if RtPriority::new(old.rt_priority).outranks(&prio) {
                rq.resched_curr();
            }
        } else if on_rq == OnRq::Queued {
            rq.check_preempt_curr(id, WakeFlags::empty());
        }
    }

    fn get_rr_interval(rq: &RunQueue, id: TaskId) -> u64 {
        match rt_entity(rq, id) {
            Some(rt) if rt.round_robin => rq.tun.rr_timeslice_ns,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::entity::TaskSlot;
    use crate::scheduler::thread::{Task, TaskRef};

    fn rq() -> RunQueue {
        let mut tun = Tunables::DEFAULT;
        tun.rr_timeslice_ns = 3 * tun.tick_ns;
        RunQueue::new(0, Task::new_idle(0), tun)
    }

    fn add(rq: &mut RunQueue, attr: SchedAttr) -> TaskRef {
        let task = Task::new("rt", attr);
        let se = RtClass::task_fork(&rq.tun, &attr);
        rq.insert_slot(TaskSlot::new(task.clone(), se));
        rq.activate_task(task.id(), EnqueueFlags::INITIAL);
        task
    }

    fn run(rq: &mut RunQueue) -> TaskId {
        rq.put_prev_task(rq.curr);
        let next = rq.pick_next_task();
        rq.curr = next;
        rq.set_next_task(next);
        next
    }

    #[test]
    fn test_highest_priority_first() {
        let mut rq = rq();
        let low = add(&mut rq, SchedAttr::fifo(50));
        let high = add(&mut rq, SchedAttr::fifo(10));
        assert_eq!(rq.rt.highest_prio(), Some(RtPriority::new(10)));
        assert_eq!(run(&mut rq), high.id());
        assert_eq!(rq.rt.highest_prio(), Some(RtPriority::new(50)));
        RtClass::check_preempt_curr(&mut rq, low.id(), WakeFlags::empty());
        assert!(!rq.resched_pending());
    }

    #[test]
    fn test_round_robin_rotates_on_expiry() {
        let mut rq = rq();
        let a = add(&mut rq, SchedAttr::round_robin(20));
        let b = add(&mut rq, SchedAttr::round_robin(20));
        assert_eq!(run(&mut rq), a.id());
        for _ in 0..2 {
            RtClass::task_tick(&mut rq, a.id(), true);
            assert!(!rq.resched_pending());
        }
        RtClass::task_tick(&mut rq, a.id(), true);
        assert!(rq.take_resched());
        assert_eq!(run(&mut rq), b.id());
        assert_eq!(rq.rt.queued_at(RtPriority::new(20)).collect::<alloc::vec::Vec<_>>(), [a.id()]);
    }

    #[test]
    fn test_lone_round_robin_keeps_cpu() {
        let mut rq = rq();
        let a = add(&mut rq, SchedAttr::round_robin(20));
        run(&mut rq);
        for _ in 0..10 {
            RtClass::task_tick(&mut rq, a.id(), true);
        }
        assert!(!rq.resched_pending());
    }

    #[test]
    fn test_fifo_never_expires() {
        let mut rq = rq();
        let a = add(&mut rq, SchedAttr::fifo(5));
        add(&mut rq, SchedAttr::fifo(5));
        run(&mut rq);
        for _ in 0..10 {
            RtClass::task_tick(&mut rq, a.id(), true);
        }
        assert!(!rq.resched_pending());
    }

    #[test]
    fn test_preempted_task_requeues_at_head() {
        let mut rq = rq();
        let a = add(&mut rq, SchedAttr::fifo(30));
        let b = add(&mut rq, SchedAttr::fifo(30));
        run(&mut rq);
        rq.put_prev_task(a.id());
        assert_eq!(
            rq.rt.queued_at(RtPriority::new(30)).collect::<alloc::vec::Vec<_>>(),
            [a.id(), b.id()]
        );
    }

    #[test]
    fn test_rr_interval() {
        let mut rq = rq();
        let rr = add(&mut rq, SchedAttr::round_robin(1));
        let fifo = add(&mut rq, SchedAttr::fifo(1));
        assert_eq!(RtClass::get_rr_interval(&rq, rr.id()), rq.tun.rr_timeslice_ns);
        assert_eq!(RtClass::get_rr_interval(&rq, fifo.id()), 0);
    }
}
