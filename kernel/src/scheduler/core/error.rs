//! Scheduler Error Handling
//!
//! Typed errors for the outer scheduler API (task registration, policy,
//! nice and affinity changes, configuration). Class operations themselves
//! never fail: invariant slips are absorbed by no-op guards and never
//! surface here.

use core::fmt;

use crate::scheduler::thread::TaskId;

/// Scheduler error types with detailed context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    // ═══════════════════════════════════════════════════════════════
    // Task Errors
    // ═══════════════════════════════════════════════════════════════

    /// Task is not registered with any runqueue
    TaskNotFound { task: TaskId },

    /// Task id already registered
    TaskAlreadyExists { task: TaskId },

    /// Task cannot be woken or moved in its current state
    TaskNotRunnable { task: TaskId },

    // ═══════════════════════════════════════════════════════════════
    // Affinity Errors
    // ═══════════════════════════════════════════════════════════════

    /// Affinity mask selects no online CPU
    InvalidCpuMask { mask: u64 },

    /// CPU index out of range
    CpuNotAvailable { cpu: usize },

    /// Destination CPU excluded by the task's affinity
    MigrationNotAllowed { task: TaskId, from_cpu: usize, to_cpu: usize },

    // ═══════════════════════════════════════════════════════════════
    // Policy Errors
    // ═══════════════════════════════════════════════════════════════

    /// RT priority out of range
    InvalidPriority { value: i32, min: i32, max: i32 },

    /// Nice value out of range
    InvalidNice { value: i32 },

    /// Unknown raw policy number
    InvalidPolicy { policy: u32 },

    /// Deadline period is zero or budget would round to zero
    InvalidDeadlineParams { period_ns: u64 },

    // ═══════════════════════════════════════════════════════════════
    // Setup Errors
    // ═══════════════════════════════════════════════════════════════

    /// Tunable rejected by validation or command-line parsing
    InvalidConfig { key: &'static str },
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task } => write!(f, "Task {} not found", task),
            Self::TaskAlreadyExists { task } => write!(f, "Task {} already registered", task),
            Self::TaskNotRunnable { task } => write!(f, "Task {} not runnable", task),
            Self::InvalidCpuMask { mask } => write!(f, "Invalid CPU mask {:#x}", mask),
            Self::CpuNotAvailable { cpu } => write!(f, "CPU {} not available", cpu),
            Self::MigrationNotAllowed { task, from_cpu, to_cpu } => {
                write!(f, "Task {} cannot migrate CPU{} -> CPU{}", task, from_cpu, to_cpu)
            }
            Self::InvalidPriority { value, min, max } => {
                write!(f, "Priority {} outside [{}, {}]", value, min, max)
            }
            Self::InvalidNice { value } => write!(f, "Nice {} outside [-20, 19]", value),
            Self::InvalidPolicy { policy } => write!(f, "Unknown policy {}", policy),
            Self::InvalidDeadlineParams { period_ns } => {
                write!(f, "Invalid deadline period {} ns", period_ns)
            }
            Self::InvalidConfig { key } => write!(f, "Invalid scheduler tunable '{}'", key),
        }
    }
}

impl SchedError {
    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "Task may have already exited",
            Self::TaskAlreadyExists { .. } => "Allocate a fresh task id",
            Self::TaskNotRunnable { .. } => "Wake the task before changing its placement",
            Self::InvalidCpuMask { .. } => "Include at least one online CPU in the mask",
            Self::CpuNotAvailable { .. } => "Use a CPU index below the online count",
            Self::MigrationNotAllowed { .. } => "Widen the affinity mask first",
            Self::InvalidPriority { .. } => "RT priorities are 0 (highest) to 99",
            Self::InvalidNice { .. } => "Nice values are -20 to 19",
            Self::InvalidPolicy { .. } => "Use Normal, Fifo, RoundRobin, Batch, Idle or Deadline",
            Self::InvalidDeadlineParams { .. } => "Use a period long enough to carry a budget",
            Self::InvalidConfig { .. } => "Check sched.* command-line values",
        }
    }

    /// Can the same request succeed later, unchanged?
    pub fn is_recoverable(&self) -> bool {
        // A running task becomes movable once it is switched out
        matches!(self, Self::TaskNotRunnable { .. })
    }

    /// Should this error be logged?
    pub fn should_log(&self) -> bool {
        // Common during exit races
        !matches!(self, Self::TaskNotFound { .. })
    }

    /// Get error severity (0-3)
    pub fn severity(&self) -> u8 {
        match self {
            Self::InvalidConfig { .. } => 2,
            Self::MigrationNotAllowed { .. } | Self::InvalidCpuMask { .. } => 1,
            _ => 0,
        }
    }
}

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Log a scheduler error with its recovery hint and evaluate to it
#[macro_export]
macro_rules! sched_error {
    ($err:expr) => {{
        let err = $err;
        if err.should_log() {
            log::error!("[SCHED] Error: {} (hint: {})", err, err.recovery_hint());
        }
        err
    }};
}

/// Critical scheduler assertion
#[macro_export]
macro_rules! sched_assert {
    ($cond:expr, $reason:expr) => {
        if !$cond {
            panic!("[SCHED CRITICAL] Invariant violated: {}", $reason);
        }
    };
}
