//! Statistics - Scheduler activity tracking
//!
//! Per-runqueue counters are plain integers protected by the runqueue
//! lock; global totals are atomics readable from anywhere.

use core::sync::atomic::{AtomicU64, Ordering};

/// Per-runqueue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RqStats {
    /// Context switches performed on this CPU
    pub nr_switches: u64,
    /// Tasks migrated onto this CPU
    pub nr_migrations_in: u64,
    /// Tasks migrated away from this CPU
    pub nr_migrations_out: u64,
    /// Balance passes on this CPU that moved at least one task
    pub nr_load_balance: u64,
    /// Wake-ups that activated a task here
    pub nr_wakeups: u64,
    /// Reschedule requests raised by preemption checks and ticks
    pub nr_preemptions: u64,
    /// Times the idle task was picked
    pub nr_idle_picks: u64,
    /// Total task execution time accounted here
    pub exec_clock: u64,
    /// Ticks processed
    pub nr_ticks: u64,
    /// Deadline budget exhaustions
    pub nr_dl_throttles: u64,
}

/// Global scheduler statistics
pub struct SchedulerStats {
    /// Total context switches
    pub total_switches: AtomicU64,
    /// Tasks registered through `wake_up_new_task`
    pub total_tasks: AtomicU64,
    /// Tasks released after exit
    pub total_released: AtomicU64,
    /// Reschedule IPIs sent
    pub ipis_sent: AtomicU64,
    /// Tasks moved between CPUs
    pub total_migrations: AtomicU64,
    /// Periodic balance passes run
    pub balance_runs: AtomicU64,
}

/// Plain copy of [`SchedulerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStatsSnapshot {
    pub total_switches: u64,
    pub total_tasks: u64,
    pub total_released: u64,
    pub ipis_sent: u64,
    pub total_migrations: u64,
    pub balance_runs: u64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            total_switches: AtomicU64::new(0),
            total_tasks: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            ipis_sent: AtomicU64::new(0),
            total_migrations: AtomicU64::new(0),
            balance_runs: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            total_switches: self.total_switches.load(Ordering::Relaxed),
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            ipis_sent: self.ipis_sent.load(Ordering::Relaxed),
            total_migrations: self.total_migrations.load(Ordering::Relaxed),
            balance_runs: self.balance_runs.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters (benchmarks)
    pub fn reset(&self) {
        self.total_switches.store(0, Ordering::Relaxed);
        self.total_tasks.store(0, Ordering::Relaxed);
        self.total_released.store(0, Ordering::Relaxed);
        self.ipis_sent.store(0, Ordering::Relaxed);
        self.total_migrations.store(0, Ordering::Relaxed);
        self.balance_runs.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = SchedulerStats::new();
        SchedulerStats::inc(&stats.total_switches);
        SchedulerStats::inc(&stats.total_switches);
        SchedulerStats::inc(&stats.ipis_sent);
        let snap = stats.snapshot();
        assert_eq!(snap.total_switches, 2);
        assert_eq!(snap.ipis_sent, 1);
        stats.reset();
        assert_eq!(stats.snapshot(), SchedulerStatsSnapshot::default());
    }
}
