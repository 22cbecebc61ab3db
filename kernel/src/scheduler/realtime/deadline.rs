//! Deadline scheduling
//!
//! Earliest-deadline-first ordering with a constant-bandwidth server per
//! task. Each period grants a fixed budget; an entity that exhausts it is
//! throttled until a replenishment timer fires at its deadline, which hands
//! out a fresh budget and pushes the deadline one period further.
//!
//! # States
//! - Dormant: no reservation; the next enqueue opens a period from now
//! - Active: holds budget, either queued on the timeline or running
//! - Throttled: off the runqueue, timer armed

use alloc::collections::BTreeSet;

use crate::scheduler::config::Tunables;
use crate::scheduler::core::class::{ClassOps, DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
use crate::scheduler::core::policy::SchedAttr;
use crate::scheduler::core::runqueue::RunQueue;
use crate::scheduler::entity::{dl_period, DlEntity, DlState, OnRq, SchedEntity};
use crate::scheduler::thread::{TaskId, TaskStats};
use crate::scheduler::timeline::Timeline;

/// `a` is strictly earlier than `b`, tolerant of clock wrap
#[inline]
pub fn dl_time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Deadline part of a runqueue
pub struct DlRq {
    /// Active entities keyed by absolute deadline
    pub timeline: Timeline,
    /// Replenishment timers: (expiry, task)
    timers: BTreeSet<(u64, TaskId)>,
    /// Queued deadline entities
    pub dl_nr_running: usize,
}

impl DlRq {
    pub fn new() -> Self {
        Self {
            timeline: Timeline::new(),
            timers: BTreeSet::new(),
            dl_nr_running: 0,
        }
    }

    pub(crate) fn arm_timer(&mut self, expires: u64, id: TaskId) {
        self.timers.insert((expires, id));
    }

    pub(crate) fn cancel_timer(&mut self, expires: u64, id: TaskId) {
        self.timers.remove(&(expires, id));
    }

    /// Earliest armed expiry
    pub fn next_timer(&self) -> Option<u64> {
        self.timers.first().map(|&(expires, _)| expires)
    }

    pub fn nr_timers(&self) -> usize {
        self.timers.len()
    }

    /// Remove and return one timer that expired at `now`
    pub(crate) fn pop_expired(&mut self, now: u64) -> Option<TaskId> {
        let &(expires, id) = self.timers.first()?;
        if expires > now {
            return None;
        }
        self.timers.remove(&(expires, id));
        Some(id)
    }
}

impl Default for DlRq {
    fn default() -> Self {
        Self::new()
    }
}

fn dl_entity(rq: &RunQueue, id: TaskId) -> Option<&DlEntity> {
    rq.slots.get(&id).and_then(|s| s.se.as_dl())
}

fn dl_entity_mut(rq: &mut RunQueue, id: TaskId) -> Option<&mut DlEntity> {
    rq.slots.get_mut(&id).and_then(|s| s.se.as_dl_mut())
}

/// Fresh budget; the deadline moves one period, or to `now + period` if
/// that still leaves it in the past
fn replenish(dl: &mut DlEntity, now: u64) {
    dl.runtime = dl.budget;
    dl.deadline = dl.deadline.saturating_add(dl.period);
    if !dl_time_before(now, dl.deadline) {
        dl.deadline = now.saturating_add(dl.period);
    }
}

/// Take `id` off the runqueue until its replenishment timer fires
fn throttle(rq: &mut RunQueue, id: TaskId) {
    let now = rq.clock_task;
    let Some(slot) = rq.slots.get_mut(&id) else {
        return;
    };
    let Some(dl) = slot.se.as_dl_mut() else {
        return;
    };
    if slot.on_rq == OnRq::Queued {
        if let Some(node) = dl.node.take() {
            rq.dl.timeline.remove(&node);
        }
        rq.dl.dl_nr_running -= 1;
        rq.nr_running -= 1;
    }
    slot.on_rq = OnRq::Off;

    dl.state = DlState::Throttled { since: now };
    let expires = if dl_time_before(now, dl.deadline) {
        dl.deadline
    } else {
        now.saturating_add(dl.period)
    };
    dl.timer = Some(expires);
    rq.dl.arm_timer(expires, id);
    rq.stats.nr_dl_throttles += 1;
    log::trace!("CPU{}: task {} throttled until {}", rq.cpu, id, expires);
}

fn cancel_reservation(rq: &mut RunQueue, id: TaskId) {
    let Some(dl) = dl_entity_mut(rq, id) else {
        return;
    };
    let timer = dl.timer.take();
    dl.state = DlState::Dormant;
    if let Some(expires) = timer {
        rq.dl.cancel_timer(expires, id);
    }
}

/// Deadline scheduling class
pub struct DeadlineClass;

impl DeadlineClass {
    /// Replenishment timer of `id` fired at `rq.clock_task`
    pub(crate) fn replenish_timer_fired(rq: &mut RunQueue, id: TaskId) {
        let now = rq.clock_task;
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        let runnable = slot.is_runnable();
        let stats: &TaskStats = slot.task.stats();
        let Some(dl) = slot.se.as_dl_mut() else {
            return;
        };
        dl.timer = None;
        let DlState::Throttled { since } = dl.state else {
            return;
        };

        stats.dl_throttled_ns.fetch_add(now.saturating_sub(since), core::sync::atomic::Ordering::Relaxed);
        TaskStats::bump(&stats.dl_replenishments);
        replenish(dl, now);

        if runnable {
            dl.state = DlState::Active;
            Self::enqueue(rq, id, EnqueueFlags::RESTORE);
            rq.check_preempt_curr(id, WakeFlags::empty());
        } else {
            dl.state = DlState::Dormant;
        }
    }
}

impl ClassOps for DeadlineClass {
    fn enqueue(rq: &mut RunQueue, id: TaskId, _flags: EnqueueFlags) {
        let now = rq.clock_task;
        let is_curr = rq.curr == id;
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        if slot.on_rq != OnRq::Off {
            return;
        }
        let Some(dl) = slot.se.as_dl_mut() else {
            return;
        };

        match dl.state {
            // The timer puts it back
            DlState::Throttled { .. } => return,
            DlState::Dormant => {
                dl.deadline = now.saturating_add(dl.period);
                dl.runtime = dl.budget;
                dl.state = DlState::Active;
            }
            DlState::Active => {
                if dl_time_before(dl.deadline, now) {
                    dl.deadline = now.saturating_add(dl.period);
                    dl.runtime = dl.budget;
                }
            }
        }

        if is_curr {
            slot.on_rq = OnRq::Current;
        } else {
            dl.node = Some(rq.dl.timeline.insert(dl.deadline, id));
            slot.on_rq = OnRq::Queued;
            rq.dl.dl_nr_running += 1;
            rq.nr_running += 1;
        }
    }

    fn dequeue(rq: &mut RunQueue, id: TaskId, _flags: DequeueFlags) {
        Self::update_curr(rq);
        let Some(slot) = rq.slots.get_mut(&id) else {
            return;
        };
        let Some(dl) = slot.se.as_dl_mut() else {
            return;
        };
        match slot.on_rq {
            OnRq::Off => return,
            OnRq::Queued => {
                if let Some(node) = dl.node.take() {
                    rq.dl.timeline.remove(&node);
                }
                rq.dl.dl_nr_running -= 1;
                rq.nr_running -= 1;
            }
            OnRq::Current => {}
        }
        slot.on_rq = OnRq::Off;
    }

    fn pick_next(rq: &mut RunQueue) -> Option<TaskId> {
        let view: &RunQueue = rq;
        let runnable = |id: TaskId| view.slots.get(&id).map_or(false, |s| s.is_runnable());
        let (key, id) = match view.dl.timeline.leftmost() {
            Some((key, id)) if runnable(id) => Some((key, id)),
            _ => view.dl.timeline.iter().find(|&(_, id)| runnable(id)),
        }?;

        rq.dl.timeline.remove(&key);
        rq.dl.dl_nr_running -= 1;
        rq.nr_running -= 1;
        let slot = rq.slots.get_mut(&id)?;
        if let Some(dl) = slot.se.as_dl_mut() {
            dl.node = None;
        }
        slot.on_rq = OnRq::Current;
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
        let Some(dl) = slot.se.as_dl_mut() else {
            return;
        };
        dl.node = Some(rq.dl.timeline.insert(dl.deadline, id));
        slot.on_rq = OnRq::Queued;
        rq.dl.dl_nr_running += 1;
        rq.nr_running += 1;
    }

    fn set_next(rq: &mut RunQueue, id: TaskId, _first: bool) {
        rq.start_exec(id);
    }

    fn task_tick(rq: &mut RunQueue, id: TaskId, _queued: bool) {
        Self::update_curr(rq);
        if rq.curr_in(SchedClass::Deadline) != Some(id) {
            return;
        }
        let Some(own) = dl_entity(rq, id).map(|dl| dl.deadline) else {
            return;
        };
        if let Some((key, _)) = rq.dl.timeline.leftmost() {
            if dl_time_before(key.key, own) {
                rq.resched_curr();
            }
        }
    }

    fn check_preempt_curr(rq: &mut RunQueue, id: TaskId, _flags: WakeFlags) {
        let waker = dl_entity(rq, id).map(|dl| dl.deadline);
        let curr = dl_entity(rq, rq.curr).map(|dl| dl.deadline);
        if let (Some(waker), Some(curr)) = (waker, curr) {
            if dl_time_before(waker, curr) {
                rq.resched_curr();
            }
        }
    }

    fn update_curr(rq: &mut RunQueue) {
        let Some(id) = rq.curr_in(SchedClass::Deadline) else {
            return;
        };
        let delta = rq.account_exec(id);
        if delta == 0 {
            return;
        }
        let Some(dl) = dl_entity_mut(rq, id) else {
            return;
        };
        if dl.state != DlState::Active {
            return;
        }
        dl.runtime = dl.runtime.saturating_sub(delta);
        if dl.runtime == 0 {
            throttle(rq, id);
            rq.resched_curr();
        }
    }

    fn yield_task(rq: &mut RunQueue, id: TaskId) {
        Self::update_curr(rq);
        if rq.curr_in(SchedClass::Deadline) != Some(id) {
            return;
        }
        // Give up the rest of this period
        if let Some(dl) = dl_entity_mut(rq, id) {
            dl.runtime = 0;
        }
        throttle(rq, id);
        rq.resched_curr();
    }

    fn task_fork(tun: &Tunables, attr: &SchedAttr) -> SchedEntity {
        let period = dl_period(tun, attr);
        SchedEntity::Deadline(DlEntity::new(period, tun.dl_budget(period)))
    }

    fn task_dead(rq: &mut RunQueue, id: TaskId) {
        cancel_reservation(rq, id);
    }

    fn switched_from(rq: &mut RunQueue, id: TaskId) {
        cancel_reservation(rq, id);
    }

    fn prio_changed(rq: &mut RunQueue, id: TaskId, _old: &SchedAttr) {
        let on_rq = rq.slots.get(&id).map(|s| s.on_rq);
        if rq.curr == id {
            let own = dl_entity(rq, id).map(|dl| dl.deadline);
            let earliest = rq.dl.timeline.leftmost().map(|(key, _)| key.key);
            if let (Some(own), Some(earliest)) = (own, earliest) {
                if dl_time_before(earliest, own) {
                    rq.resched_curr();
                }
            }
        } else if on_rq == Some(OnRq::Queued) {
            rq.check_preempt_curr(id, WakeFlags::empty());
        }
    }
}
