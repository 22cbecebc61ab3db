//! cpusched: multi-class SMP CPU scheduler core
//!
//! `no_std` + `alloc`. The machine is reached only through
//! [`scheduler::Platform`]; hosted builds and tests drive the scheduler with
//! [`scheduler::SimPlatform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logger;
pub mod scheduler;
pub mod sync;

pub use scheduler::{
    Platform, SchedAttr, SchedConfig, SchedError, SchedPolicy, SchedResult, Scheduler, SimPlatform,
    Task, TaskRef, TaskState,
};
