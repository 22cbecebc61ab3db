//! Blocking primitives built on the scheduler's wake path

pub mod completion;
pub mod wait_queue;

pub use completion::Completion;
pub use wait_queue::{WaitQueue, WaitResult};
