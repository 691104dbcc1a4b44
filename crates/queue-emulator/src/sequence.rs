//! Atomic sequence number assignment.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter assigning globally unique, strictly increasing sequence
/// numbers to enqueued messages, individually or in contiguous blocks.
///
/// Lock-free; safe under unbounded concurrent callers. Numbers start at zero
/// and are never reused or skipped within one generator's lifetime.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous sequence numbers and return the first.
    ///
    /// The caller owns the range `[first, first + count)`. `count` must be
    /// at least 1.
    pub fn next(&self, count: u64) -> u64 {
        debug_assert!(count >= 1, "sequence reservation must cover at least one id");
        // Relaxed suffices: the counter carries no other synchronization duty.
        self.next.fetch_add(count, Ordering::Relaxed)
    }

    /// Sequence number the next reservation would start at.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "sequence_tests.rs"]
mod tests;
