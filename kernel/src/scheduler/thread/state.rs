//! State - Task state machine
//!
//! The lifecycle state is written by the task itself (going to sleep,
//! exiting) and by wakers, so it lives in an atomic outside the runqueue
//! lock. Transitions that must not race with enqueue/dequeue are re-checked
//! under the lock by the scheduler core.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TaskState {
    /// Runnable or running
    Running = 0,

    /// Sleeping, woken by signals or explicit wake-ups
    Interruptible = 1,

    /// Sleeping, only explicit wake-ups
    Uninterruptible = 2,

    /// Exited, waiting to be reaped
    Zombie = 3,

    /// Exited and reaped
    Dead = 4,
}

impl TaskState {
    /// Convert from u64
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Running),
            1 => Some(Self::Interruptible),
            2 => Some(Self::Uninterruptible),
            3 => Some(Self::Zombie),
            4 => Some(Self::Dead),
            _ => None,
        }
    }

    /// Can sit in a ready structure
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_sleeping(self) -> bool {
        matches!(self, Self::Interruptible | Self::Uninterruptible)
    }

    /// Control block may be released after the switch away
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Zombie | Self::Dead)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Running => write!(f, "R"),
            Self::Interruptible => write!(f, "S"),
            Self::Uninterruptible => write!(f, "D"),
            Self::Zombie => write!(f, "Z"),
            Self::Dead => write!(f, "X"),
        }
    }
}

/// Atomic task state
pub struct AtomicTaskState {
    state: AtomicU64,
}

impl AtomicTaskState {
    /// Create new atomic state
    pub const fn new(state: TaskState) -> Self {
        Self {
            state: AtomicU64::new(state as u64),
        }
    }

    /// Load current state
    pub fn load(&self) -> TaskState {
        let value = self.state.load(Ordering::Acquire);
        TaskState::from_u64(value).unwrap_or(TaskState::Dead)
    }

    /// Store new state
    pub fn store(&self, state: TaskState) {
        self.state.store(state as u64, Ordering::Release);
    }

    /// Compare and exchange state
    pub fn compare_exchange(
        &self,
        current: TaskState,
        new: TaskState,
    ) -> Result<TaskState, TaskState> {
        self.state
            .compare_exchange(current as u64, new as u64, Ordering::AcqRel, Ordering::Acquire)
            .map(|old| TaskState::from_u64(old).unwrap_or(TaskState::Dead))
            .map_err(|actual| TaskState::from_u64(actual).unwrap_or(TaskState::Dead))
    }
}

impl fmt::Debug for AtomicTaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.load())
    }
}
