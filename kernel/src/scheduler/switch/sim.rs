//! Software platform
//!
//! A clock that only moves when told to, a settable "current CPU", and
//! recorders for switches, IPIs and released tasks. Context switches are
//! bookkeeping only: `switch_to` returns `prev` immediately, as if the old
//! context had been resumed right after the new one ran.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::Platform;
use crate::scheduler::thread::{TaskId, TaskRef};

/// Deterministic platform for hosted runs
pub struct SimPlatform {
    now: AtomicU64,
    cpu: AtomicUsize,
    irqs_enabled: AtomicBool,
    switches: Mutex<Vec<(TaskId, TaskId)>>,
    ipis: Mutex<Vec<usize>>,
    released: Mutex<Vec<TaskId>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            cpu: AtomicUsize::new(0),
            irqs_enabled: AtomicBool::new(true),
            switches: Mutex::new(Vec::new()),
            ipis: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward by `ns`
    pub fn advance(&self, ns: u64) -> u64 {
        self.now.fetch_add(ns, Ordering::SeqCst) + ns
    }

    pub fn set_now(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// CPU reported by `this_cpu()`
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled.load(Ordering::SeqCst)
    }

    /// (prev, next) pairs in switch order
    pub fn switches(&self) -> Vec<(TaskId, TaskId)> {
        self.switches.lock().clone()
    }

    /// IPI targets in send order
    pub fn ipis(&self) -> Vec<usize> {
        self.ipis.lock().clone()
    }

    pub fn released(&self) -> Vec<TaskId> {
        self.released.lock().clone()
    }

    pub fn clear_records(&self) {
        self.switches.lock().clear();
        self.ipis.lock().clear();
        self.released.lock().clear();
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn this_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn send_reschedule_ipi(&self, cpu: usize) {
        self.ipis.lock().push(cpu);
    }

    fn irq_save(&self) -> bool {
        self.irqs_enabled.swap(false, Ordering::SeqCst)
    }

    fn irq_restore(&self, enabled: bool) {
        self.irqs_enabled.store(enabled, Ordering::SeqCst);
    }

    unsafe fn switch_to(&self, prev: &TaskRef, next: &TaskRef) -> TaskRef {
        self.switches.lock().push((prev.id(), next.id()));
        prev.clone()
    }

    fn release_task(&self, task: &TaskRef) {
        self.released.lock().push(task.id());
    }
}
