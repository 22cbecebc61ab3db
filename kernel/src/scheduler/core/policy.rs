//! Scheduling Policies
//!
//! Policy identifiers and per-task scheduling attributes:
//! - SCHED_DEADLINE: EDF ordering with a constant-bandwidth budget
//! - SCHED_FIFO: real-time FIFO (runs until it blocks, yields or is outranked)
//! - SCHED_RR: real-time round-robin (rotates within its priority level)
//! - SCHED_NORMAL / SCHED_BATCH: weighted fair share by nice value
//! - SCHED_IDLE: fair share at the lowest possible weight
//!
//! The nice-to-weight table is the classic 40-entry geometric table
//! (each step is roughly 1.25x), NICE_0_WEIGHT = 1024.

use static_assertions::const_assert_eq;

use super::error::{SchedError, SchedResult};

/// Number of RT priority levels (0 = highest)
pub const MAX_RT_PRIO: usize = 100;

/// Lowest RT priority value
pub const RT_PRIO_LOWEST: u8 = (MAX_RT_PRIO - 1) as u8;

pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;

/// Load weight of a nice-0 task
pub const NICE_0_WEIGHT: u64 = 1024;

/// Weight of SCHED_IDLE tasks
pub const WEIGHT_IDLEPRIO: u32 = 3;

/// nice -20 .. 19 -> load weight
pub const NICE_TO_WEIGHT: [u32; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

const_assert_eq!(MAX_RT_PRIO, 100);
const_assert_eq!(NICE_TO_WEIGHT.len(), (MAX_NICE - MIN_NICE + 1) as usize);
const_assert_eq!(NICE_TO_WEIGHT[20] as u64, NICE_0_WEIGHT);

/// Clamp a nice value into [-20, 19]
pub fn clamp_nice(nice: i32) -> i32 {
    nice.clamp(MIN_NICE, MAX_NICE)
}

/// Load weight for a nice value (clamped)
pub fn nice_to_weight(nice: i32) -> u32 {
    NICE_TO_WEIGHT[(clamp_nice(nice) - MIN_NICE) as usize]
}

/// Scheduling policy identifiers (Linux SCHED_* values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum SchedPolicy {
    /// Normal time-sharing
    #[default]
    Normal = 0,
    /// Real-time FIFO
    Fifo = 1,
    /// Real-time Round-Robin
    RoundRobin = 2,
    /// CPU-bound batch work, fair class
    Batch = 3,
    /// Lowest fair weight
    Idle = 5,
    /// Earliest Deadline First + CBS
    Deadline = 6,
}

impl SchedPolicy {
    /// Create from raw value (Linux compatible)
    pub fn from_raw(value: u32) -> SchedResult<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Fifo),
            2 => Ok(Self::RoundRobin),
            3 => Ok(Self::Batch),
            5 => Ok(Self::Idle),
            6 => Ok(Self::Deadline),
            _ => Err(SchedError::InvalidPolicy { policy: value }),
        }
    }

    /// FIFO or RR
    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::Fifo | Self::RoundRobin)
    }

    pub fn is_fair(&self) -> bool {
        matches!(self, Self::Normal | Self::Batch | Self::Idle)
    }
}

/// Per-task scheduling attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttr {
    pub policy: SchedPolicy,
    /// Nice value (-20 to 19), fair policies only
    pub nice: i32,
    /// RT priority, 0 (highest) to 99
    pub rt_priority: u8,
    /// Deadline period in ns (0 = configured default)
    pub dl_period_ns: u64,
    /// Children start as SCHED_NORMAL nice 0
    pub reset_on_fork: bool,
}

impl SchedAttr {
    /// SCHED_NORMAL at the given nice
    pub const fn normal(nice: i32) -> Self {
        Self {
            policy: SchedPolicy::Normal,
            nice,
            rt_priority: 0,
            dl_period_ns: 0,
            reset_on_fork: false,
        }
    }

    pub const fn batch(nice: i32) -> Self {
        Self { policy: SchedPolicy::Batch, ..Self::normal(nice) }
    }

    pub const fn idle() -> Self {
        Self { policy: SchedPolicy::Idle, ..Self::normal(MAX_NICE) }
    }

    pub const fn fifo(rt_priority: u8) -> Self {
        Self { policy: SchedPolicy::Fifo, rt_priority, ..Self::normal(0) }
    }

    pub const fn round_robin(rt_priority: u8) -> Self {
        Self { policy: SchedPolicy::RoundRobin, rt_priority, ..Self::normal(0) }
    }

    /// SCHED_DEADLINE with an explicit period (0 = default period)
    pub const fn deadline(period_ns: u64) -> Self {
        Self { policy: SchedPolicy::Deadline, dl_period_ns: period_ns, ..Self::normal(0) }
    }

    /// Validate values coming from outside the scheduler
    pub fn validate(&self) -> SchedResult<()> {
        if !(MIN_NICE..=MAX_NICE).contains(&self.nice) {
            return Err(SchedError::InvalidNice { value: self.nice });
        }
        if self.policy.is_realtime() && self.rt_priority as usize >= MAX_RT_PRIO {
            return Err(SchedError::InvalidPriority {
                value: self.rt_priority as i32,
                min: 0,
                max: RT_PRIO_LOWEST as i32,
            });
        }
        Ok(())
    }

    /// Fair-class load weight for these attributes
    pub fn weight(&self) -> u32 {
        match self.policy {
            SchedPolicy::Idle => WEIGHT_IDLEPRIO,
            _ => nice_to_weight(self.nice),
        }
    }

    /// Attributes a forked child starts with
    pub fn for_child(&self) -> Self {
        if self.reset_on_fork {
            Self::normal(0)
        } else {
            *self
        }
    }
}

impl Default for SchedAttr {
    fn default() -> Self {
        Self::normal(0)
    }
}
