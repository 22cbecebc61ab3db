//! Task module

pub mod state;
pub mod task;

pub use state::{AtomicTaskState, TaskState};
pub use task::{alloc_task_id, Task, TaskFlags, TaskId, TaskRef, TaskStats, TaskStatsSnapshot};
