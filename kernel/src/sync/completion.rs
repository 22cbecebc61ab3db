//! Completion
//!
//! A counted "this happened" signal. `complete` releases one waiter,
//! `complete_all` releases every present and future waiter until `reinit`.

use spin::Mutex;

use super::wait_queue::{WaitQueue, WaitResult};
use crate::scheduler::switch::Platform;
use crate::scheduler::thread::TaskState;
use crate::scheduler::Scheduler;

/// Done count meaning "completed for everyone"
const COMPLETE_ALL: u32 = u32::MAX;

pub struct Completion {
    done: Mutex<u32>,
    wait: WaitQueue,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: Mutex::new(0),
            wait: WaitQueue::new(),
        }
    }

    /// Signal once and wake one waiter
    pub fn complete<P: Platform>(&self, sched: &Scheduler<P>) {
        {
            let mut done = self.done.lock();
            if *done != COMPLETE_ALL {
                *done += 1;
            }
        }
        self.wait.wake_up_nr(sched, 1);
    }

    /// Signal permanently and wake every waiter
    pub fn complete_all<P: Platform>(&self, sched: &Scheduler<P>) {
        *self.done.lock() = COMPLETE_ALL;
        self.wait.wake_up_all(sched);
    }

    /// Consume one signal without sleeping
    pub fn try_wait_for_completion(&self) -> bool {
        let mut done = self.done.lock();
        match *done {
            0 => false,
            COMPLETE_ALL => true,
            _ => {
                *done -= 1;
                true
            }
        }
    }

    /// Sleep until a signal can be consumed.
    ///
    /// Same return contract as [`WaitQueue::wait_event`].
    pub fn wait_for_completion<P: Platform>(&self, sched: &Scheduler<P>, cpu: usize) -> bool {
        self.wait
            .wait_common(sched, cpu, true, TaskState::Uninterruptible, None, || self.try_wait_for_completion())
            .is_done()
    }

    /// Bounded [`Completion::wait_for_completion`]: `Done` carries the time
    /// left, `TimedOut` means no signal was consumed
    pub fn wait_for_completion_timeout<P: Platform>(
        &self,
        sched: &Scheduler<P>,
        cpu: usize,
        timeout_ns: u64,
    ) -> WaitResult {
        self.wait.wait_common(
            sched,
            cpu,
            true,
            TaskState::Uninterruptible,
            Some(timeout_ns),
            || self.try_wait_for_completion(),
        )
    }

    /// A signal is pending
    pub fn completion_done(&self) -> bool {
        *self.done.lock() > 0
    }

    pub fn reinit(&self) {
        *self.done.lock() = 0;
    }

    pub fn nr_waiters(&self) -> usize {
        self.wait.len()
    }
}

impl Default for Completion {
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

    #[test]
    fn test_counts_signals() {
        let s = Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap();
        let done = Completion::new();
        assert!(!done.try_wait_for_completion());
        done.complete(&s);
        done.complete(&s);
        assert!(done.completion_done());
        assert!(done.try_wait_for_completion());
        assert!(done.try_wait_for_completion());
        assert!(!done.completion_done());
    }

    #[test]
    fn test_complete_all_saturates() {
        let s = Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap();
        let done = Completion::new();
        done.complete_all(&s);
        done.complete(&s);
        for _ in 0..10 {
            assert!(done.try_wait_for_completion());
        }
        done.reinit();
        assert!(!done.completion_done());
    }

    #[test]
    fn test_waiter_sleeps_until_complete() {
        let s = Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap();
        let task = Task::new("waiter", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        s.schedule(0);

        let done = Completion::new();
        assert!(!done.wait_for_completion(&s, 0));
        assert_eq!(task.state(), TaskState::Uninterruptible);
        assert_eq!(done.nr_waiters(), 1);

        done.complete(&s);
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(done.nr_waiters(), 0);

        s.schedule(0);
        assert!(done.wait_for_completion(&s, 0));
        assert!(!done.completion_done());
    }

    #[test]
    fn test_timeout_completed_in_time() {
        let s = Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap();
        let task = Task::new("waiter", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        s.schedule(0);

        let done = Completion::new();
        assert_eq!(done.wait_for_completion_timeout(&s, 0, 10_000_000), WaitResult::Pending);
        s.platform().advance(3_000_000);
        done.complete(&s);
        s.check_preempt(0);
        assert_eq!(s.current(0).unwrap().id(), task.id());

        assert_eq!(done.wait_for_completion_timeout(&s, 0, 10_000_000), WaitResult::Done(7_000_000));
        assert!(!done.completion_done());
        assert_eq!(done.nr_waiters(), 0);
    }

    #[test]
    fn test_timeout_without_complete() {
        let s = Scheduler::new(SimPlatform::new(), 1, SchedConfig::new()).unwrap();
        let task = Task::new("waiter", SchedAttr::default());
        s.wake_up_new_task(&task).unwrap();
        s.schedule(0);

        let done = Completion::new();
        assert_eq!(done.wait_for_completion_timeout(&s, 0, 2_000_000), WaitResult::Pending);
        for _ in 0..2 {
            s.platform().advance(1_000_000);
            s.scheduler_tick(0);
            s.check_preempt(0);
        }
        assert_eq!(s.current(0).unwrap().id(), task.id());

        assert_eq!(done.wait_for_completion_timeout(&s, 0, 2_000_000), WaitResult::TimedOut);
        assert_eq!(done.nr_waiters(), 0);

        // A late signal stays pending for the next waiter
        done.complete(&s);
        assert!(done.completion_done());
    }
}
