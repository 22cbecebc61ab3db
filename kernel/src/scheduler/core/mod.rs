//! Scheduler core
//!
//! Runqueues, the class dispatch table and the per-CPU entry points.
//! Class-specific policy lives next door in `fair`, `realtime` and `idle`.

pub mod affinity;
pub mod class;
pub mod error;
pub mod loadbalancer;
pub mod policy;
pub mod runqueue;
pub mod scheduler;
pub mod statistics;

pub use affinity::CpuMask;
pub use class::{ClassOps, DequeueFlags, EnqueueFlags, SchedClass, WakeFlags};
pub use error::{SchedError, SchedResult};
pub use loadbalancer::Migration;
pub use policy::{SchedAttr, SchedPolicy};
pub use runqueue::RunQueue;
pub use scheduler::{PreemptGuard, Scheduler};
pub use statistics::{RqStats, SchedulerStats, SchedulerStatsSnapshot};
