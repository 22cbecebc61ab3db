//! Affinity - CPU affinity masks
//!
//! Controls which CPUs a task may be placed on. `select_task_rq` and every
//! migration path consult the mask before touching a runqueue.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

use crate::scheduler::MAX_CPUS;

const_assert!(MAX_CPUS <= 64);

/// CPU affinity mask (64 CPUs max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Create empty mask
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create mask allowing all CPUs
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// Create mask for single CPU
    pub const fn single(cpu: usize) -> Self {
        Self(1 << (cpu & 63))
    }

    /// Mask covering CPUs `0..nr_cpus`
    pub const fn first_n(nr_cpus: usize) -> Self {
        if nr_cpus >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << nr_cpus) - 1)
        }
    }

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Set CPU bit
    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1 << (cpu & 63);
    }

    /// Clear CPU bit
    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !(1 << (cpu & 63));
    }

    /// Check if CPU is set
    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < 64 && (self.0 & (1 << cpu)) != 0
    }

    /// Count set CPUs
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Get first set CPU
    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Intersect with another mask
    pub fn intersect(&self, other: &Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Iterate over set CPUs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Affinity mask readable without the runqueue lock
#[derive(Debug)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, mask: CpuMask) {
        self.0.store(mask.0, Ordering::Release);
    }

    /// Check if the task may run on `cpu`
    pub fn allows(&self, cpu: usize) -> bool {
        self.load().is_set(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_single_and_first() {
        let mask = CpuMask::single(5);
        assert!(mask.is_set(5));
        assert!(!mask.is_set(4));
        assert_eq!(mask.first(), Some(5));
        assert_eq!(CpuMask::empty().first(), None);
    }

    #[test]
    fn test_first_n() {
        assert_eq!(CpuMask::first_n(3).bits(), 0b111);
        assert_eq!(CpuMask::first_n(64), CpuMask::all());
        assert!(CpuMask::first_n(0).is_empty());
    }

    #[test]
    fn test_iter_ascending() {
        let mut mask = CpuMask::empty();
        mask.set(9);
        mask.set(1);
        mask.set(63);
        assert_eq!(mask.iter().collect::<Vec<_>>(), [1, 9, 63]);
        mask.clear(9);
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn test_out_of_range_cpu_never_allowed() {
        assert!(!CpuMask::all().is_set(64));
    }

    #[test]
    fn test_atomic_mask_round_trip() {
        let mask = AtomicCpuMask::new(CpuMask::all());
        mask.store(CpuMask::single(2));
        assert!(mask.allows(2));
        assert!(!mask.allows(0));
    }
}
