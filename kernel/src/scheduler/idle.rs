//! Idle Class
//!
//! One idle task per CPU, created with the runqueue and never queued.
//! It is what `pick_next` falls back to when every other class is empty,
//! and any runnable task of another class preempts it.

use crate::scheduler::config::Tunables;
use crate::scheduler::core::class::{ClassOps, DequeueFlags, EnqueueFlags, WakeFlags};
use crate::scheduler::core::policy::SchedAttr;
use crate::scheduler::core::runqueue::RunQueue;
use crate::scheduler::entity::{OnRq, SchedEntity};
use crate::scheduler::thread::TaskId;

/// Idle scheduling class
pub struct IdleClass;

impl ClassOps for IdleClass {
    fn enqueue(_rq: &mut RunQueue, _id: TaskId, _flags: EnqueueFlags) {}

    fn dequeue(_rq: &mut RunQueue, _id: TaskId, _flags: DequeueFlags) {}

    fn pick_next(rq: &mut RunQueue) -> Option<TaskId> {
        let idle = rq.idle;
        let slot = rq.slots.get_mut(&idle)?;
        slot.on_rq = OnRq::Current;
        rq.stats.nr_idle_picks += 1;
        Some(idle)
    }

    fn put_prev(rq: &mut RunQueue, id: TaskId) {
        if let Some(slot) = rq.slots.get_mut(&id) {
            slot.on_rq = OnRq::Off;
        }
    }

    fn set_next(rq: &mut RunQueue, id: TaskId, _first: bool) {
        rq.start_exec(id);
    }

    fn task_tick(_rq: &mut RunQueue, _id: TaskId, _queued: bool) {}

    fn check_preempt_curr(_rq: &mut RunQueue, _id: TaskId, _flags: WakeFlags) {}

    // Idle time is not task time
    fn update_curr(_rq: &mut RunQueue) {}

    fn yield_task(_rq: &mut RunQueue, _id: TaskId) {}

    fn task_fork(_tun: &Tunables, _attr: &SchedAttr) -> SchedEntity {
        SchedEntity::Idle
    }
}
