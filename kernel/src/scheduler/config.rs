//! Scheduler Runtime Configuration
//!
//! Tunables for the scheduling classes and the balancer. Values live in
//! atomics so they can be changed at runtime; each runqueue works from a
//! plain [`Tunables`] snapshot refreshed on every tick.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::scheduler::core::error::{SchedError, SchedResult};

const NSEC_PER_MSEC: u64 = 1_000_000;

/// Plain copy of the tunables, read by class code under the runqueue lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Fair: period in which every runnable task runs once
    pub sched_latency_ns: u64,
    /// Fair: minimum slice before a tick may preempt
    pub min_granularity_ns: u64,
    /// Fair: vruntime lead a waker needs to preempt
    pub wakeup_granularity_ns: u64,
    /// Tick period the platform timer is programmed with
    pub tick_ns: u64,
    /// RT: round-robin quantum
    pub rr_timeslice_ns: u64,
    /// Deadline: period when the task did not ask for one
    pub dl_default_period_ns: u64,
    /// Deadline: budget as a percentage of the period
    pub dl_bandwidth_pct: u64,
    /// Ticks between periodic balance passes
    pub balance_interval_ticks: u64,
    /// Migrate when the runnable spread exceeds this
    pub imbalance_threshold: u64,
    /// Pull work when a CPU is about to go idle
    pub idle_balance: bool,
}

impl Tunables {
    pub const DEFAULT: Tunables = Tunables {
        sched_latency_ns: 6 * NSEC_PER_MSEC,
        min_granularity_ns: 750_000,
        wakeup_granularity_ns: NSEC_PER_MSEC,
        tick_ns: NSEC_PER_MSEC,
        rr_timeslice_ns: 100 * NSEC_PER_MSEC,
        dl_default_period_ns: 100 * NSEC_PER_MSEC,
        dl_bandwidth_pct: 20,
        balance_interval_ticks: 100,
        imbalance_threshold: 1,
        idle_balance: true,
    };

    /// Deadline budget for a period
    pub fn dl_budget(&self, period_ns: u64) -> u64 {
        ((period_ns as u128 * self.dl_bandwidth_pct as u128) / 100) as u64
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> SchedResult<()> {
        if self.sched_latency_ns == 0 {
            return Err(SchedError::InvalidConfig { key: "latency_ns" });
        }
        if self.min_granularity_ns == 0 || self.min_granularity_ns > self.sched_latency_ns {
            return Err(SchedError::InvalidConfig { key: "min_granularity_ns" });
        }
        if self.tick_ns == 0 {
            return Err(SchedError::InvalidConfig { key: "tick_ns" });
        }
        if self.rr_timeslice_ns == 0 {
            return Err(SchedError::InvalidConfig { key: "rr_timeslice_ns" });
        }
        if self.dl_default_period_ns == 0 {
            return Err(SchedError::InvalidConfig { key: "dl_period_ns" });
        }
        if self.dl_bandwidth_pct == 0 || self.dl_bandwidth_pct > 100 {
            return Err(SchedError::InvalidConfig { key: "dl_bandwidth_pct" });
        }
        if self.balance_interval_ticks == 0 {
            return Err(SchedError::InvalidConfig { key: "balance_interval" });
        }
        Ok(())
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runtime configuration
pub struct SchedConfig {
    sched_latency_ns: AtomicU64,
    min_granularity_ns: AtomicU64,
    wakeup_granularity_ns: AtomicU64,
    tick_ns: AtomicU64,
    rr_timeslice_ns: AtomicU64,
    dl_default_period_ns: AtomicU64,
    dl_bandwidth_pct: AtomicU64,
    balance_interval_ticks: AtomicU64,
    imbalance_threshold: AtomicU64,
    idle_balance: AtomicBool,
}

impl SchedConfig {
    /// Create default configuration
    pub const fn new() -> Self {
        Self::from_tunables(Tunables::DEFAULT)
    }

    pub const fn from_tunables(t: Tunables) -> Self {
        Self {
            sched_latency_ns: AtomicU64::new(t.sched_latency_ns),
            min_granularity_ns: AtomicU64::new(t.min_granularity_ns),
            wakeup_granularity_ns: AtomicU64::new(t.wakeup_granularity_ns),
            tick_ns: AtomicU64::new(t.tick_ns),
            rr_timeslice_ns: AtomicU64::new(t.rr_timeslice_ns),
            dl_default_period_ns: AtomicU64::new(t.dl_default_period_ns),
            dl_bandwidth_pct: AtomicU64::new(t.dl_bandwidth_pct),
            balance_interval_ticks: AtomicU64::new(t.balance_interval_ticks),
            imbalance_threshold: AtomicU64::new(t.imbalance_threshold),
            idle_balance: AtomicBool::new(t.idle_balance),
        }
    }

    /// Current values
    pub fn snapshot(&self) -> Tunables {
        Tunables {
            sched_latency_ns: self.sched_latency_ns.load(Ordering::Relaxed),
            min_granularity_ns: self.min_granularity_ns.load(Ordering::Relaxed),
            wakeup_granularity_ns: self.wakeup_granularity_ns.load(Ordering::Relaxed),
            tick_ns: self.tick_ns.load(Ordering::Relaxed),
            rr_timeslice_ns: self.rr_timeslice_ns.load(Ordering::Relaxed),
            dl_default_period_ns: self.dl_default_period_ns.load(Ordering::Relaxed),
            dl_bandwidth_pct: self.dl_bandwidth_pct.load(Ordering::Relaxed),
            balance_interval_ticks: self.balance_interval_ticks.load(Ordering::Relaxed),
            imbalance_threshold: self.imbalance_threshold.load(Ordering::Relaxed),
            idle_balance: self.idle_balance.load(Ordering::Relaxed),
        }
    }

    /// Validate and install a full set of tunables
    pub fn apply(&self, t: Tunables) -> SchedResult<()> {
        t.validate().map_err(|e| crate::sched_error!(e))?;
        self.sched_latency_ns.store(t.sched_latency_ns, Ordering::Relaxed);
        self.min_granularity_ns.store(t.min_granularity_ns, Ordering::Relaxed);
        self.wakeup_granularity_ns.store(t.wakeup_granularity_ns, Ordering::Relaxed);
        self.tick_ns.store(t.tick_ns, Ordering::Relaxed);
        self.rr_timeslice_ns.store(t.rr_timeslice_ns, Ordering::Relaxed);
        self.dl_default_period_ns.store(t.dl_default_period_ns, Ordering::Relaxed);
        self.dl_bandwidth_pct.store(t.dl_bandwidth_pct, Ordering::Relaxed);
        self.balance_interval_ticks.store(t.balance_interval_ticks, Ordering::Relaxed);
        self.imbalance_threshold.store(t.imbalance_threshold, Ordering::Relaxed);
        self.idle_balance.store(t.idle_balance, Ordering::Relaxed);
        log::info!(
            "Scheduler tunables: latency={}ns min_gran={}ns wakeup_gran={}ns rr={}ns dl_bw={}%",
            t.sched_latency_ns,
            t.min_granularity_ns,
            t.wakeup_granularity_ns,
            t.rr_timeslice_ns,
            t.dl_bandwidth_pct
        );
        Ok(())
    }

    /// Set the fair-class latency target
    pub fn set_sched_latency(&self, ns: u64) -> SchedResult<()> {
        let mut t = self.snapshot();
        t.sched_latency_ns = ns;
        self.apply(t)
    }

    /// Set the round-robin quantum
    pub fn set_rr_timeslice(&self, ns: u64) -> SchedResult<()> {
        let mut t = self.snapshot();
        t.rr_timeslice_ns = ns;
        self.apply(t)
    }

    /// Enable/disable newly-idle balancing
    pub fn set_idle_balance(&self, enabled: bool) {
        self.idle_balance.store(enabled, Ordering::Relaxed);
        log::info!(
            "Idle balance: {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_idle_balance_enabled(&self) -> bool {
        self.idle_balance.load(Ordering::Relaxed)
    }

    /// Load configuration from kernel parameters
    ///
    /// Example: `sched.latency_ns=4000000 sched.rr_timeslice_ms=50 sched.idle_balance=0`.
    /// Items without the `sched.` prefix are ignored. Nothing is applied
    /// unless every `sched.` item parses and the result validates.
    pub fn load_from_cmdline(&self, cmdline: &str) -> SchedResult<()> {
        log::debug!("Loading scheduler config from command line");
        let mut t = self.snapshot();
        for item in cmdline.split_whitespace() {
            let Some(setting) = item.strip_prefix("sched.") else {
                continue;
            };
            let (key, value) = setting
                .split_once('=')
                .ok_or(SchedError::InvalidConfig { key: "sched" })?;
            apply_setting(&mut t, key, value)?;
        }
        self.apply(t)
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_setting(t: &mut Tunables, key: &str, value: &str) -> SchedResult<()> {
    let (field, scale): (&mut u64, u64) = match key {
        "latency_ns" => (&mut t.sched_latency_ns, 1),
        "latency_ms" => (&mut t.sched_latency_ns, NSEC_PER_MSEC),
        "min_granularity_ns" => (&mut t.min_granularity_ns, 1),
        "wakeup_granularity_ns" => (&mut t.wakeup_granularity_ns, 1),
        "tick_ns" => (&mut t.tick_ns, 1),
        "rr_timeslice_ns" => (&mut t.rr_timeslice_ns, 1),
        "rr_timeslice_ms" => (&mut t.rr_timeslice_ns, NSEC_PER_MSEC),
        "dl_period_ns" => (&mut t.dl_default_period_ns, 1),
        "dl_period_ms" => (&mut t.dl_default_period_ns, NSEC_PER_MSEC),
        "dl_bandwidth_pct" => (&mut t.dl_bandwidth_pct, 1),
        "balance_interval" => (&mut t.balance_interval_ticks, 1),
        "imbalance_threshold" => (&mut t.imbalance_threshold, 1),
        "idle_balance" => {
            t.idle_balance = match value {
                "1" | "on" | "true" => true,
                "0" | "off" | "false" => false,
                _ => return Err(SchedError::InvalidConfig { key: "idle_balance" }),
            };
            return Ok(());
        }
        _ => {
            log::warn!("Unknown scheduler parameter sched.{}", key);
            return Err(SchedError::InvalidConfig { key: "sched" });
        }
    };
    let parsed: u64 = value
        .parse()
        .map_err(|_| SchedError::InvalidConfig { key: "sched" })?;
    *field = parsed
        .checked_mul(scale)
        .ok_or(SchedError::InvalidConfig { key: "sched" })?;
    Ok(())
}
