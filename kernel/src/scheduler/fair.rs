//! Fair Class - Weighted virtual-runtime scheduling
//!
//! Runnable entities are ordered by virtual runtime on a [`Timeline`]; the
//! leftmost entity has received the least weighted CPU time and runs next.
//! Virtual time advances at `delta * NICE_0_WEIGHT / weight`, so a heavier
//! entity accumulates it more slowly and gets a proportionally larger share.
//!
//! # Normalization
//! An entity leaving the runqueue for sleep or migration stores its
//! vruntime relative to `min_vruntime`; the next enqueue adds the
//! destination's `min_vruntime` back. A temporary SAVE/RESTORE pair keeps
//! the absolute value.

use crate::scheduler::config::Tunables;
use crate::scheduler::core::class::{ClassOps, DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
use crate::scheduler::core::policy::{SchedAttr, NICE_0_WEIGHT};
use crate::scheduler::core::runqueue::RunQueue;
use crate::scheduler::entity::{FairEntity, OnRq, SchedEntity};
use crate::scheduler::thread::TaskId;
use crate::scheduler::timeline::Timeline;

/// Fair-class part of a runqueue
pub struct FairRq {
    pub timeline: Timeline,
    /// Monotonic floor for placing new and waking entities
    pub min_vruntime: u64,
    /// Weight of queued entities plus the running one
    pub load_weight: u64,
    /// Queued entities plus the running one
    pub nr_running: usize,
}

impl FairRq {
    pub fn new() -> Self {
        Self {
            timeline: Timeline::new(),
            min_vruntime: 0,
            load_weight: 0,
            nr_running: 0,
        }
    }
}

impl Default for FairRq {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale `delta` ns of execution into virtual time for `weight`
pub fn calc_delta_fair(delta: u64, weight: u32) -> u64 {
    if weight as u64 == NICE_0_WEIGHT {
        return delta;
    }
    let scaled = delta as u128 * NICE_0_WEIGHT as u128 / weight.max(1) as u128;
    scaled.min(u64::MAX as u128) as u64
}

/// Period over which every runnable entity runs once
pub fn sched_period(tun: &Tunables, nr_running: usize) -> u64 {
    let nr_latency = tun.sched_latency_ns / tun.min_granularity_ns.max(1);
    if nr_running as u64 > nr_latency {
        nr_running as u64 * tun.min_granularity_ns
    } else {
        tun.sched_latency_ns
    }
}

/// Wall-clock slice for an entity of `weight` on `rq`
pub fn sched_slice(rq: &RunQueue, weight: u32) -> u64 {
    let period = sched_period(&rq.tun, rq.cfs.nr_running.max(1));
    let total = rq.cfs.load_weight.max(weight as u64).max(1);
    (period as u128 * weight as u128 / total as u128) as u64
}

fn fair_entity(rq: &RunQueue, id: TaskId) -> Option<&FairEntity> {
    rq.slots.get(&id).and_then(|s| s.se.as_fair())
}

fn fair_entity_mut(rq: &mut RunQueue, id: TaskId) -> Option<&mut FairEntity> {
    rq.slots.get_mut(&id).and_then(|s| s.se.as_fair_mut())
}

/// Advance `min_vruntime` to min(curr, leftmost), never backwards
fn update_min_vruntime(rq: &mut RunQueue) {
    let curr = rq
        .curr_in(SchedClass::Fair)
        .and_then(|id| fair_entity(rq, id))
        .map(|fe| fe.vruntime);
    let leftmost = rq.cfs.timeline.leftmost().map(|(key, _)| key.key);

    let candidate = match (curr, leftmost) {
        (Some(c), Some(l)) => c.min(l),
        (Some(v), None) | (None, Some(v)) => v,
        (None, None) => return,
    };
    if candidate > rq.cfs.min_vruntime {
        rq.cfs.min_vruntime = candidate;
    }
}

/// Fair scheduling class
pub struct FairClass;

impl ClassOps for FairClass {
    fn enqueue(rq: &mut RunQueue, id: TaskId, _flags: EnqueueFlags) {
        Self::update_curr(rq);
        let min_vruntime = rq.cfs.min_vruntime;
        let is_curr = rq.curr == id;

        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        if slot.on_rq != OnRq::Off {
            return;
        }
        let Some(fe) = slot.se.as_fair_mut() else {
            return;
        };

        // The relative value is never negative, so a sleeper comes back at
        // or after min_vruntime and carries no credit for the time away
        if fe.normalized {
            fe.vruntime = fe.vruntime.saturating_add(min_vruntime);
            fe.normalized = false;
        }

        if is_curr {
            slot.on_rq = OnRq::Current;
        } else {
            fe.node = Some(rq.cfs.timeline.insert(fe.vruntime, id));
            slot.on_rq = OnRq::Queued;
            rq.nr_running += 1;
        }
        rq.cfs.load_weight += fe.weight as u64;
        rq.cfs.nr_running += 1;
        update_min_vruntime(rq);
    }

    fn dequeue(rq: &mut RunQueue, id: TaskId, flags: DequeueFlags) {
        Self::update_curr(rq);
        let min_vruntime = rq.cfs.min_vruntime;

        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        let Some(fe) = slot.se.as_fair_mut() else {
            return;
        };
        match slot.on_rq {
            OnRq::Off => return,
            OnRq::Queued => {
                if let Some(node) = fe.node.take() {
                    rq.cfs.timeline.remove(&node);
                }
                rq.nr_running -= 1;
            }
            OnRq::Current => {}
        }
        slot.on_rq = OnRq::Off;
        rq.cfs.load_weight -= fe.weight as u64;
        rq.cfs.nr_running -= 1;

        if !flags.contains(DequeueFlags::SAVE)
            && flags.intersects(DequeueFlags::SLEEP | DequeueFlags::MOVE)
        {
            fe.vruntime = fe.vruntime.saturating_sub(min_vruntime);
            fe.normalized = true;
        }
        update_min_vruntime(rq);
    }

    fn pick_next(rq: &mut RunQueue) -> Option<TaskId> {
        // The cached leftmost is a hint; fall forward past anything that is
        // no longer runnable
        let view: &RunQueue = rq;
        let runnable = |id: TaskId| view.slots.get(&id).map_or(false, |s| s.is_runnable());
        let picked = match view.cfs.timeline.leftmost() {
            Some((key, id)) if runnable(id) => Some((key, id)),
            _ => view.cfs.timeline.iter().find(|&(_, id)| runnable(id)),
        }?;

        let (key, id) = picked;
        rq.cfs.timeline.remove(&key);
        let slot = rq.slots.get_mut(&id)?;
        if let Some(fe) = slot.se.as_fair_mut() {
            fe.node = None;
        }
        slot.on_rq = OnRq::Current;
        rq.nr_running -= 1;
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
        if let Some(fe) = slot.se.as_fair_mut() {
            fe.node = Some(rq.cfs.timeline.insert(fe.vruntime, id));
            slot.on_rq = OnRq::Queued;
            rq.nr_running += 1;
        }
    }

    fn set_next(rq: &mut RunQueue, id: TaskId, _first: bool) {
        rq.start_exec(id);
    }

    fn task_tick(rq: &mut RunQueue, id: TaskId, _queued: bool) {
        Self::update_curr(rq);
        if rq.cfs.nr_running <= 1 {
            return;
        }
        let Some(slot) = rq.slots.get(&id) else {
            return;
        };
        let Some(fe) = slot.se.as_fair() else {
            return;
        };
        let used = slot.exec.slice_used();
        if used > sched_slice(rq, fe.weight) {
            rq.resched_curr();
        }
    }

    fn check_preempt_curr(rq: &mut RunQueue, id: TaskId, _flags: WakeFlags) {
        Self::update_curr(rq);
        let curr = fair_entity(rq, rq.curr).map(|fe| fe.vruntime);
        let waker = fair_entity(rq, id).map(|fe| fe.vruntime);
        if let (Some(curr), Some(waker)) = (curr, waker) {
            if curr > waker.saturating_add(rq.tun.wakeup_granularity_ns) {
                rq.resched_curr();
            }
        }
    }

    fn update_curr(rq: &mut RunQueue) {
        let Some(id) = rq.curr_in(SchedClass::Fair) else {
            return;
        };
        let delta = rq.account_exec(id);
        if delta == 0 {
            return;
        }
        if let Some(fe) = fair_entity_mut(rq, id) {
            fe.vruntime = fe.vruntime.saturating_add(calc_delta_fair(delta, fe.weight));
        }
        update_min_vruntime(rq);
    }

    fn yield_task(rq: &mut RunQueue, id: TaskId) {
        Self::update_curr(rq);
        if rq.curr_in(SchedClass::Fair) != Some(id) {
            return;
        }
        let Some(weight) = fair_entity(rq, id).map(|fe| fe.weight) else {
            return;
        };
        let slice = sched_slice(rq, weight);
        if let Some(fe) = fair_entity_mut(rq, id) {
            fe.vruntime = fe.vruntime.saturating_add(slice);
        }
        rq.resched_curr();
    }

    fn task_fork(_tun: &Tunables, attr: &SchedAttr) -> SchedEntity {
        SchedEntity::Fair(FairEntity::new(attr.weight()))
    }

    fn switched_to(rq: &mut RunQueue, id: TaskId) {
        if let Some(slot) = rq.slots.get_mut(&id) {
            if slot.on_rq == OnRq::Off {
                if let Some(fe) = slot.se.as_fair_mut() {
                    fe.vruntime = 0;
                    fe.normalized = true;
                }
            }
        }
    }

    fn prio_changed(rq: &mut RunQueue, id: TaskId, old: &SchedAttr) {
        let Some(slot) = rq.slots.get(&id) else {
            return;
        };
        let weight = slot.se.as_fair().map_or(0, |fe| fe.weight);
        let on_rq = slot.on_rq;
        if rq.curr == id {
            if weight < old.weight() {
                rq.resched_curr();
            }
        } else if on_rq == OnRq::Queued {
            rq.check_preempt_curr(id, WakeFlags::empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::entity::TaskSlot;
    use crate::scheduler::thread::{Task, TaskRef, TaskState};

    fn rq() -> RunQueue {
        RunQueue::new(0, Task::new_idle(0), Tunables::DEFAULT)
    }

    fn add(rq: &mut RunQueue, nice: i32) -> TaskRef {
        let attr = SchedAttr::normal(nice);
        let task = Task::new("fair", attr);
        let se = SchedClass::Fair.task_fork(&rq.tun, &attr);
        rq.insert_slot(TaskSlot::new(task.clone(), se));
        rq.activate_task(task.id(), EnqueueFlags::INITIAL);
        task
    }

    fn run(rq: &mut RunQueue) -> TaskId {
        let prev = rq.curr;
        rq.put_prev_task(prev);
        let next = rq.pick_next_task();
        rq.curr = next;
        rq.set_next_task(next);
        next
    }

    fn vruntime(rq: &RunQueue, id: TaskId) -> u64 {
        rq.slot(id).unwrap().se.as_fair().unwrap().vruntime
    }

    #[test]
    fn test_calc_delta_scales_by_weight() {
        assert_eq!(calc_delta_fair(1_000, 1024), 1_000);
        assert_eq!(calc_delta_fair(1_000, 2048), 500);
        assert_eq!(calc_delta_fair(335, 335), 1_024);
    }

    #[test]
    fn test_sched_period_stretches() {
        let tun = Tunables::DEFAULT;
        assert_eq!(sched_period(&tun, 3), tun.sched_latency_ns);
        assert_eq!(sched_period(&tun, 8), tun.sched_latency_ns);
        assert_eq!(sched_period(&tun, 9), 9 * tun.min_granularity_ns);
    }

    #[test]
    fn test_leftmost_runs_first() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        let b = add(&mut rq, 0);
        assert_eq!(run(&mut rq), a.id());
        rq.update_clock(2_000_000);
        rq.update_curr();
        assert_eq!(vruntime(&rq, a.id()), 2_000_000);
        assert_eq!(run(&mut rq), b.id());
        assert_eq!(rq.cfs.min_vruntime, 0);
    }

    #[test]
    fn test_heavier_entity_ages_slower() {
        let mut rq = rq();
        let heavy = add(&mut rq, -5);
        assert_eq!(run(&mut rq), heavy.id());
        rq.update_clock(3_121);
        rq.update_curr();
        assert_eq!(vruntime(&rq, heavy.id()), 1_024);
    }

    #[test]
    fn test_min_vruntime_is_monotonic() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        run(&mut rq);
        rq.update_clock(5_000);
        rq.update_curr();
        assert_eq!(rq.cfs.min_vruntime, 5_000);
        let late = add(&mut rq, 0);
        assert_eq!(vruntime(&rq, late.id()), 5_000);
        a.set_state(TaskState::Interruptible);
        rq.deactivate_task(a.id(), DequeueFlags::SLEEP);
        assert_eq!(rq.cfs.min_vruntime, 5_000);
    }

    #[test]
    fn test_sleep_wake_round_trip() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        let b = add(&mut rq, 0);
        run(&mut rq);
        rq.update_clock(1_000);
        rq.update_curr();
        a.set_state(TaskState::Interruptible);
        rq.deactivate_task(a.id(), DequeueFlags::SLEEP);
        let slot = rq.slot(a.id()).unwrap().se.as_fair().copied().unwrap();
        assert!(slot.normalized);
        assert_eq!(slot.vruntime, 1_000);

        run(&mut rq);
        assert_eq!(rq.curr, b.id());
        rq.update_clock(50_000);
        rq.update_curr();
        a.set_state(TaskState::Running);
        rq.activate_task(a.id(), EnqueueFlags::WAKEUP);
        // 1_000 relative to a min_vruntime of 49_000
        assert_eq!(rq.cfs.min_vruntime, 49_000);
        assert_eq!(vruntime(&rq, a.id()), 50_000);
    }

    #[test]
    fn test_save_restore_keeps_absolute() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        let _b = add(&mut rq, 0);
        let before = vruntime(&rq, a.id());
        rq.deactivate_task(a.id(), DequeueFlags::SAVE);
        assert!(!rq.slot(a.id()).unwrap().se.as_fair().unwrap().normalized);
        rq.activate_task(a.id(), EnqueueFlags::RESTORE);
        assert_eq!(vruntime(&rq, a.id()), before);
        assert_eq!(rq.cfs.nr_running, 2);
        assert_eq!(rq.nr_running, 2);
    }

    #[test]
    fn test_tick_preempts_after_slice() {
        let mut rq = rq();
        add(&mut rq, 0);
        add(&mut rq, 0);
        let curr = run(&mut rq);
        rq.update_clock(2_000_000);
        FairClass::task_tick(&mut rq, curr, true);
        assert!(!rq.resched_pending());
        rq.update_clock(3_000_001);
        FairClass::task_tick(&mut rq, curr, true);
        assert!(rq.resched_pending());
    }

    #[test]
    fn test_wakeup_preemption_needs_granularity() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        let b = add(&mut rq, 0);
        run(&mut rq);
        assert_eq!(rq.curr, a.id());
        rq.update_clock(500_000);
        FairClass::check_preempt_curr(&mut rq, b.id(), WakeFlags::empty());
        assert!(!rq.resched_pending());
        rq.update_clock(1_500_000);
        FairClass::check_preempt_curr(&mut rq, b.id(), WakeFlags::empty());
        assert!(rq.resched_pending());
    }

    #[test]
    fn test_yield_moves_behind_peer() {
        let mut rq = rq();
        let a = add(&mut rq, 0);
        let b = add(&mut rq, 0);
        run(&mut rq);
        FairClass::yield_task(&mut rq, a.id());
        assert!(rq.take_resched());
        assert_eq!(run(&mut rq), b.id());
    }
}
