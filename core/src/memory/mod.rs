//! Memory pools and budgets.
//!
//! Packets are recycled through a bounded [`Pool`]: the source stage acquires
//! a buffer, the output stage returns it, and the pool's alloc/return
//! counters make leak checks cheap. Segment and stream-message storage is
//! owned by the flow state that holds it; their global footprint is enforced
//! by [`MemBudget`] caps that flip the engine into emergency mode when
//! exceeded.

pub mod pool;

pub use pool::Pool;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Byte-accounted memory cap shared by one object class.
#[derive(Debug)]
pub struct MemBudget {
    cap: u64,
    used: AtomicU64,
    emergency: AtomicBool,
}

impl MemBudget {
    pub fn new(cap: u64) -> Self {
        MemBudget {
            cap,
            used: AtomicU64::new(0),
            emergency: AtomicBool::new(false),
        }
    }

    /// Tries to reserve `bytes`. On failure the budget enters emergency mode
    /// and the caller must drop the allocation.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            if cur + bytes > self.cap {
                self.emergency.store(true, Ordering::Release);
                return false;
            }
            match self.used.compare_exchange_weak(
                cur,
                cur + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
        // Leave emergency once usage drops below half the cap.
        if prev - bytes < self.cap / 2 {
            self.emergency.store(false, Ordering::Release);
        }
    }

    #[inline]
    pub fn in_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_enters_and_leaves_emergency() {
        let b = MemBudget::new(100);
        assert!(b.try_reserve(80));
        assert!(!b.in_emergency());
        assert!(!b.try_reserve(40));
        assert!(b.in_emergency());
        b.release(60);
        assert!(!b.in_emergency());
        assert_eq!(b.used(), 20);
    }
}
