//! Load Balancer - Multi-CPU task distribution
//!
//! Two entry points:
//! - Periodic: every `balance_interval_ticks` ticks the busiest and idlest
//!   CPUs are compared and one task moves when the spread is too large
//! - Idle: a CPU about to run its idle task pulls one task from the busiest
//!   peer
//!
//! Only fair tasks move, and only ones that are neither running nor pinned
//! away from the destination. The least recently run entity (the timeline's
//! leftmost) is preferred. `balance_lock` serializes passes; a pass that
//! finds it taken is skipped rather than retried.

use alloc::vec::Vec;

use super::class::WakeFlags;
use super::runqueue::{move_task, RunQueue};
use super::scheduler::Scheduler;
use super::statistics::SchedulerStats;
use crate::scheduler::switch::{IrqGuard, Platform};
use crate::scheduler::thread::TaskId;

/// One task moved by a balance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub task: TaskId,
    pub from: usize,
    pub to: usize,
}

/// Fair task on `src` that may move to `dest_cpu`
fn find_candidate(src: &RunQueue, dest_cpu: usize) -> Option<TaskId> {
    src.cfs.timeline.iter().map(|(_, id)| id).find(|&id| {
        id != src.curr
            && id != src.idle
            && src
                .slot(id)
                .map_or(false, |s| s.is_runnable() && s.task.can_run_on(dest_cpu))
    })
}

impl<P: Platform> Scheduler<P> {
    /// Runnable count of every CPU, each read under its own lock
    fn cpu_loads(&self) -> Vec<usize> {
        (0..self.nr_cpus()).map(|cpu| self.nr_runnable(cpu)).collect()
    }

    /// Periodic pass; moves at most one task
    pub fn load_balance(&self, this_cpu: usize) -> Option<Migration> {
        if self.nr_cpus() < 2 {
            return None;
        }
        let _balance = self.balance_lock.try_lock()?;
        SchedulerStats::inc(&self.stats.balance_runs);

        let loads = self.cpu_loads();
        let (busiest, max) = loads
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0), |best, (cpu, load)| if load > best.1 { (cpu, load) } else { best });
        let (idlest, min) = loads
            .iter()
            .copied()
            .enumerate()
            .fold((0, usize::MAX), |best, (cpu, load)| if load < best.1 { (cpu, load) } else { best });

        let threshold = self.config.snapshot().imbalance_threshold as usize;
        if busiest == idlest || max - min <= threshold {
            return None;
        }

        let migration = self.pull_one(busiest, idlest, this_cpu)?;
        log::debug!(
            "[BALANCE] CPU{}: task {} CPU{} -> CPU{} (loads {} / {})",
            this_cpu,
            migration.task,
            busiest,
            idlest,
            max,
            min
        );
        Some(migration)
    }

    /// A CPU with nothing queued pulls one task from the busiest peer.
    /// Must be called without `this_cpu`'s runqueue lock held.
    pub fn idle_balance(&self, this_cpu: usize) -> bool {
        if self.nr_cpus() < 2 || !self.config.is_idle_balance_enabled() {
            return false;
        }
        let Some(_balance) = self.balance_lock.try_lock() else {
            return false;
        };

        let busiest = (0..self.nr_cpus())
            .filter(|&cpu| cpu != this_cpu)
            .map(|cpu| (cpu, self.with_rq(cpu, |rq| rq.cfs.timeline.len()).unwrap_or(0)))
            .filter(|&(_, queued)| queued > 0)
            .max_by_key(|&(cpu, queued)| (queued, core::cmp::Reverse(cpu)))
            .map(|(cpu, _)| cpu);
        let Some(busiest) = busiest else {
            return false;
        };

        match self.pull_one(busiest, this_cpu, this_cpu) {
            Some(migration) => {
                log::debug!("[BALANCE] CPU{} idle: pulled task {} from CPU{}", this_cpu, migration.task, busiest);
                true
            }
            None => false,
        }
    }

    /// Move one eligible fair task from `src` to `dst` and notify `dst`
    fn pull_one(&self, src: usize, dst: usize, this_cpu: usize) -> Option<Migration> {
        let pulled = {
            let _irq = IrqGuard::new(self.platform());
            let (mut src_rq, mut dst_rq) = self.double_rq_lock(src, dst);
            let id = find_candidate(&src_rq, dst)?;
            if !move_task(&mut src_rq, &mut dst_rq, id) {
                return None;
            }
            src_rq.stats.nr_load_balance += 1;
            dst_rq.check_preempt_curr(id, WakeFlags::MIGRATED);
            let need_resched = dst_rq.take_resched();
            (id, need_resched)
        };
        let (task, need_resched) = pulled;

        SchedulerStats::inc(&self.stats.total_migrations);
        if need_resched {
            self.set_need_resched(dst, this_cpu);
        } else if dst != this_cpu {
            self.send_ipi(dst);
        }
        Some(Migration { task, from: src, to: dst })
    }
}
