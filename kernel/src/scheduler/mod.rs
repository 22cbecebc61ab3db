//! Scheduler subsystem
//!
//! Four classes, strictly ordered: Deadline (EDF with CBS throttling),
//! Real-Time (FIFO and round-robin over 100 priority levels), Fair
//! (weighted virtual runtime) and Idle. Every CPU owns a runqueue holding
//! one queue per class; `schedule()` asks the classes in order and runs the
//! first task offered.

pub mod config;
pub mod core;
pub mod entity;
pub mod fair;
pub mod idle;
pub mod realtime;
pub mod switch;
pub mod thread;
pub mod timeline;

/// Upper bound on CPUs, set by the width of [`CpuMask`]
pub const MAX_CPUS: usize = 64;

pub use self::config::{SchedConfig, Tunables};
pub use self::core::{
    CpuMask, Migration, RqStats, SchedAttr, SchedClass, SchedError, SchedPolicy, SchedResult,
    Scheduler, SchedulerStatsSnapshot, WakeFlags,
};
pub use switch::{Platform, SimPlatform};
pub use thread::{Task, TaskFlags, TaskId, TaskRef, TaskState, TaskStatsSnapshot};
