//! Context switch and platform hooks
//!
//! The scheduler core is architecture-neutral. Everything it needs from the
//! machine (a clock, the CPU id, interrupt masking, reschedule IPIs and the
//! register-level switch itself) goes through [`Platform`].
//!
//! [`sim::SimPlatform`] implements it in software for hosted tests.

pub mod sim;

pub use sim::SimPlatform;

use crate::scheduler::thread::TaskRef;

/// Machine services used by the scheduler
pub trait Platform: Send + Sync {
    /// Monotonic time in ns
    fn now_ns(&self) -> u64;

    /// Id of the CPU executing the caller
    fn this_cpu(&self) -> usize;

    /// Ask `cpu` to run `schedule()` soon
    fn send_reschedule_ipi(&self, cpu: usize);

    /// Mask local interrupts, returning the previous state
    fn irq_save(&self) -> bool;

    /// Restore the state returned by [`Platform::irq_save`]
    fn irq_restore(&self, enabled: bool);

    /// Switch register state from `prev` to `next`.
    ///
    /// Returns the task that was running on this CPU right before the
    /// caller's context resumed, which `schedule()` hands to its
    /// post-switch cleanup.
    ///
    /// # Safety
    /// - Called with no runqueue lock held and local interrupts masked
    /// - `prev` must be the task executing on this CPU
    /// - `next` must not be executing on any CPU
    unsafe fn switch_to(&self, prev: &TaskRef, next: &TaskRef) -> TaskRef;

    /// Last reference to an exited task is being dropped
    fn release_task(&self, _task: &TaskRef) {}
}

/// Interrupts masked for the guard's lifetime
pub struct IrqGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
    enabled: bool,
}

impl<'a, P: Platform + ?Sized> IrqGuard<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        let enabled = platform.irq_save();
        Self { platform, enabled }
    }
}

impl<P: Platform + ?Sized> Drop for IrqGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.enabled);
    }
}
