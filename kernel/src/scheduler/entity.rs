//! Scheduling entities
//!
//! Per-task bookkeeping owned by a runqueue slot. Exactly one class entity
//! exists per task and its variant is the task's scheduling class.

use crate::scheduler::config::Tunables;
use crate::scheduler::core::class::SchedClass;
use crate::scheduler::core::policy::{SchedAttr, SchedPolicy};
use crate::scheduler::realtime::priorities::RtPriority;
use crate::scheduler::thread::TaskRef;
use crate::scheduler::timeline::TimelineKey;

/// Where a task sits relative to its runqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRq {
    /// Not runnable here (sleeping, throttled, or never enqueued)
    Off,
    /// In the class ready structure, counted in `nr_running`
    Queued,
    /// Runnable and executing as `rq.curr`, outside the ready structure
    Current,
}

/// Execution time bookkeeping shared by all classes
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecClock {
    /// `clock_task` when accounting last ran
    pub exec_start: u64,
    /// Total runtime while owned by this runqueue's classes
    pub sum_exec: u64,
    /// `sum_exec` when the task last became current
    pub prev_sum_exec: u64,
}

impl ExecClock {
    /// Charge time since `exec_start`; returns the delta
    pub fn advance(&mut self, now: u64) -> u64 {
        if now <= self.exec_start {
            return 0;
        }
        let delta = now - self.exec_start;
        self.exec_start = now;
        self.sum_exec += delta;
        delta
    }

    /// Runtime since the task last became current
    pub fn slice_used(&self) -> u64 {
        self.sum_exec - self.prev_sum_exec
    }

    pub fn start(&mut self, now: u64) {
        self.exec_start = now;
        self.prev_sum_exec = self.sum_exec;
    }
}

/// Fair-class entity
#[derive(Debug, Clone, Copy)]
pub struct FairEntity {
    /// Virtual runtime; relative to `min_vruntime` while `normalized`
    pub vruntime: u64,
    pub normalized: bool,
    pub weight: u32,
    /// Timeline handle while queued
    pub node: Option<TimelineKey>,
}

impl FairEntity {
    /// Entity placed at `min_vruntime` on its first enqueue
    pub fn new(weight: u32) -> Self {
        Self {
            vruntime: 0,
            normalized: true,
            weight,
            node: None,
        }
    }
}

/// Real-time entity
#[derive(Debug, Clone, Copy)]
pub struct RtEntity {
    pub prio: RtPriority,
    pub round_robin: bool,
    /// Remaining round-robin slice in ns
    pub time_slice: u64,
    /// Go to the tail of the priority list on the next put_prev
    pub requeue_tail: bool,
}

/// Deadline entity lifecycle, combined with [`OnRq`]:
/// Active+Queued, Active+Current, Throttled (Off), Dormant (Off)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlState {
    /// No current reservation; the next enqueue opens a fresh period
    Dormant,
    /// Holds budget for the current deadline
    Active,
    /// Budget exhausted at `since`; waiting for the replenishment timer
    Throttled { since: u64 },
}

/// Deadline entity
#[derive(Debug, Clone, Copy)]
pub struct DlEntity {
    pub state: DlState,
    /// Absolute deadline (ns since boot)
    pub deadline: u64,
    pub period: u64,
    /// Full budget per period
    pub budget: u64,
    /// Remaining budget
    pub runtime: u64,
    /// Armed replenishment timer expiry
    pub timer: Option<u64>,
    pub node: Option<TimelineKey>,
}

impl DlEntity {
    pub fn new(period: u64, budget: u64) -> Self {
        Self {
            state: DlState::Dormant,
            deadline: 0,
            period,
            budget,
            runtime: 0,
            timer: None,
            node: None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self.state, DlState::Throttled { .. })
    }
}

/// Class entity; the variant selects the scheduling class
#[derive(Debug, Clone, Copy)]
pub enum SchedEntity {
    Deadline(DlEntity),
    RealTime(RtEntity),
    Fair(FairEntity),
    Idle,
}

impl SchedEntity {
    pub fn class(&self) -> SchedClass {
        match self {
            Self::Deadline(_) => SchedClass::Deadline,
            Self::RealTime(_) => SchedClass::RealTime,
            Self::Fair(_) => SchedClass::Fair,
            Self::Idle => SchedClass::Idle,
        }
    }

    pub fn as_fair(&self) -> Option<&FairEntity> {
        match self {
            Self::Fair(fe) => Some(fe),
            _ => None,
        }
    }

    pub fn as_fair_mut(&mut self) -> Option<&mut FairEntity> {
        match self {
            Self::Fair(fe) => Some(fe),
            _ => None,
        }
    }

    pub fn as_rt(&self) -> Option<&RtEntity> {
        match self {
            Self::RealTime(rt) => Some(rt),
            _ => None,
        }
    }

    pub fn as_rt_mut(&mut self) -> Option<&mut RtEntity> {
        match self {
            Self::RealTime(rt) => Some(rt),
            _ => None,
        }
    }

    pub fn as_dl(&self) -> Option<&DlEntity> {
        match self {
            Self::Deadline(dl) => Some(dl),
            _ => None,
        }
    }

    pub fn as_dl_mut(&mut self) -> Option<&mut DlEntity> {
        match self {
            Self::Deadline(dl) => Some(dl),
            _ => None,
        }
    }

    /// Apply new attributes without leaving the class.
    ///
    /// Must run while the entity is off the ready structures: the weight or
    /// priority it was queued under has to match the one it is removed with.
    pub fn refresh(&mut self, tun: &Tunables, attr: &SchedAttr) {
        match self {
            Self::Fair(fe) => fe.weight = attr.weight(),
            Self::RealTime(rt) => {
                rt.prio = RtPriority::new(attr.rt_priority);
                rt.round_robin = attr.policy == SchedPolicy::RoundRobin;
            }
            Self::Deadline(dl) => {
                dl.period = dl_period(tun, attr);
                dl.budget = tun.dl_budget(dl.period);
                dl.runtime = dl.runtime.min(dl.budget);
            }
            Self::Idle => {}
        }
    }
}

/// Reservation period for `attr`, falling back to the configured default
pub fn dl_period(tun: &Tunables, attr: &SchedAttr) -> u64 {
    if attr.dl_period_ns == 0 {
        tun.dl_default_period_ns
    } else {
        attr.dl_period_ns
    }
}

/// Runqueue-owned scheduling state of one task
#[derive(Debug)]
pub struct TaskSlot {
    pub task: TaskRef,
    pub on_rq: OnRq,
    pub exec: ExecClock,
    pub se: SchedEntity,
}

impl TaskSlot {
    pub fn new(task: TaskRef, se: SchedEntity) -> Self {
        Self {
            task,
            on_rq: OnRq::Off,
            exec: ExecClock::default(),
            se,
        }
    }

    pub fn class(&self) -> SchedClass {
        self.se.class()
    }

    pub fn is_runnable(&self) -> bool {
        self.task.state().is_runnable()
    }
}

/// Class a policy maps to
pub fn class_of(policy: SchedPolicy) -> SchedClass {
    match policy {
        SchedPolicy::Deadline => SchedClass::Deadline,
        SchedPolicy::Fifo | SchedPolicy::RoundRobin => SchedClass::RealTime,
        SchedPolicy::Normal | SchedPolicy::Batch | SchedPolicy::Idle => SchedClass::Fair,
    }
}
