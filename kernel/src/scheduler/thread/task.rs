//! Task Control Block
//!
//! The part of a task the scheduler core reads. Everything here is either
//! atomic or behind its own small lock, so wakers and policy syscalls can
//! inspect a task without holding its runqueue lock. Per-class scheduling
//! entities are not stored here: they live in the owning runqueue's slot
//! table (see `core::runqueue`).

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::state::{AtomicTaskState, TaskState};
use crate::scheduler::core::affinity::{AtomicCpuMask, CpuMask};
use crate::scheduler::core::policy::{SchedAttr, SchedPolicy};

/// Task ID type
pub type TaskId = u64;

/// Shared handle to a task
pub type TaskRef = Arc<Task>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh task id
pub fn alloc_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Per-task flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Kernel thread
        const KTHREAD = 1 << 0;
        /// Per-CPU idle task
        const IDLE    = 1 << 1;
        /// Exit in progress
        const EXITING = 1 << 2;
        /// Left on a CPU its affinity excludes; moved on the next switch-out
        const MIGRATE_PENDING = 1 << 3;
    }
}

/// Execution statistics, updated under the runqueue lock, read lock-free
#[derive(Debug, Default)]
pub struct TaskStats {
    /// Total CPU time consumed
    pub sum_exec_ns: AtomicU64,
    /// Voluntary context switches
    pub nvcsw: AtomicU64,
    /// Involuntary context switches
    pub nivcsw: AtomicU64,
    /// Times moved to another CPU
    pub nr_migrations: AtomicU64,
    /// Successful wake-ups
    pub nr_wakeups: AtomicU64,
    /// Deadline budget replenishments
    pub dl_replenishments: AtomicU64,
    /// Time spent throttled after exhausting the deadline budget
    pub dl_throttled_ns: AtomicU64,
}

/// Plain copy of [`TaskStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStatsSnapshot {
    pub sum_exec_ns: u64,
    pub nvcsw: u64,
    pub nivcsw: u64,
    pub nr_migrations: u64,
    pub nr_wakeups: u64,
    pub dl_replenishments: u64,
    pub dl_throttled_ns: u64,
}

impl TaskStats {
    pub fn snapshot(&self) -> TaskStatsSnapshot {
        TaskStatsSnapshot {
            sum_exec_ns: self.sum_exec_ns.load(Ordering::Relaxed),
            nvcsw: self.nvcsw.load(Ordering::Relaxed),
            nivcsw: self.nivcsw.load(Ordering::Relaxed),
            nr_migrations: self.nr_migrations.load(Ordering::Relaxed),
            nr_wakeups: self.nr_wakeups.load(Ordering::Relaxed),
            dl_replenishments: self.dl_replenishments.load(Ordering::Relaxed),
            dl_throttled_ns: self.dl_throttled_ns.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_exec(&self, delta_ns: u64) {
        self.sum_exec_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Task control block
pub struct Task {
    id: TaskId,
    name: String,
    state: AtomicTaskState,
    flags: AtomicU32,
    /// CPU whose runqueue owns this task's slot
    cpu: AtomicUsize,
    affinity: AtomicCpuMask,
    attr: Mutex<SchedAttr>,
    stats: TaskStats,
}

impl Task {
    /// New runnable task with a fresh id
    pub fn new(name: &str, attr: SchedAttr) -> TaskRef {
        Self::with_id(alloc_task_id(), name, attr)
    }

    /// New runnable task with a caller-chosen id
    pub fn with_id(id: TaskId, name: &str, attr: SchedAttr) -> TaskRef {
        Arc::new(Self {
            id,
            name: String::from(name),
            state: AtomicTaskState::new(TaskState::Running),
            flags: AtomicU32::new(TaskFlags::KTHREAD.bits()),
            cpu: AtomicUsize::new(0),
            affinity: AtomicCpuMask::new(CpuMask::all()),
            attr: Mutex::new(attr),
            stats: TaskStats::default(),
        })
    }

    /// Per-CPU idle task, pinned to `cpu`
    pub(crate) fn new_idle(cpu: usize) -> TaskRef {
        let task = Self::new(&alloc::format!("idle/{}", cpu), SchedAttr::idle());
        task.insert_flags(TaskFlags::IDLE);
        task.cpu.store(cpu, Ordering::Release);
        task.affinity.store(CpuMask::single(cpu));
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Set the lifecycle state (sleep preparation, exit)
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state);
    }

    pub(crate) fn state_cell(&self) -> &AtomicTaskState {
        &self.state
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn insert_flags(&self, flags: TaskFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: TaskFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(TaskFlags::IDLE)
    }

    /// CPU currently owning the task
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn affinity(&self) -> CpuMask {
        self.affinity.load()
    }

    pub(crate) fn set_affinity_mask(&self, mask: CpuMask) {
        self.affinity.store(mask);
    }

    pub fn can_run_on(&self, cpu: usize) -> bool {
        self.affinity.allows(cpu)
    }

    pub fn attr(&self) -> SchedAttr {
        *self.attr.lock()
    }

    pub(crate) fn set_attr(&self, attr: SchedAttr) {
        *self.attr.lock() = attr;
    }

    pub fn policy(&self) -> SchedPolicy {
        self.attr.lock().policy
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .field("policy", &self.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_runnable() {
        let task = Task::new("worker", SchedAttr::normal(0));
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.flags().contains(TaskFlags::KTHREAD));
        assert!(!task.is_idle());
        assert_eq!(task.affinity(), CpuMask::all());
    }

    #[test]
    fn test_idle_task_is_pinned() {
        let idle = Task::new_idle(3);
        assert!(idle.is_idle());
        assert_eq!(idle.cpu(), 3);
        assert!(idle.can_run_on(3));
        assert!(!idle.can_run_on(0));
        assert_eq!(idle.name(), "idle/3");
        assert_eq!(Task::new_idle(12).name(), "idle/12");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("a", SchedAttr::default());
        let b = Task::new("b", SchedAttr::default());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_stats_snapshot() {
        let task = Task::new("s", SchedAttr::default());
        task.stats().add_exec(500);
        TaskStats::bump(&task.stats().nvcsw);
        let snap = task.stats().snapshot();
        assert_eq!(snap.sum_exec_ns, 500);
        assert_eq!(snap.nvcsw, 1);
    }
}
