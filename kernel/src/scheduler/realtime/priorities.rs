//! Real-time priority management
//!
//! Internal RT priorities run from 0 (highest) to 99 (lowest). The
//! presence bitmap has one bit per level, so the best non-empty level is a
//! trailing-zero scan over two words.

use crate::scheduler::core::policy::{MAX_RT_PRIO, RT_PRIO_LOWEST};

/// Real-time priority, lower value = more important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RtPriority(u8);

impl RtPriority {
    pub const HIGHEST: RtPriority = RtPriority(0);
    pub const LOWEST: RtPriority = RtPriority(RT_PRIO_LOWEST);

    /// Out-of-range values clamp to the lowest level
    pub fn new(priority: u8) -> Self {
        Self(priority.min(RT_PRIO_LOWEST))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Strictly more important than `other`
    pub fn outranks(&self, other: &RtPriority) -> bool {
        self.0 < other.0
    }
}

impl Default for RtPriority {
    fn default() -> Self {
        Self::LOWEST
    }
}

const WORDS: usize = (MAX_RT_PRIO + 63) / 64;

/// One bit per non-empty priority level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioBitmap([u64; WORDS]);

impl PrioBitmap {
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    pub fn set(&mut self, prio: usize) {
        self.0[prio / 64] |= 1 << (prio % 64);
    }

    pub fn clear(&mut self, prio: usize) {
        self.0[prio / 64] &= !(1 << (prio % 64));
    }

    pub fn is_set(&self, prio: usize) -> bool {
        prio < MAX_RT_PRIO && self.0[prio / 64] & (1 << (prio % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Most important non-empty level
    pub fn first(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, &w)| w != 0)
            .map(|(i, &w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Non-empty levels, most important first
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }
}
