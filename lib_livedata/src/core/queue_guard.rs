//! # Broadcast Queue Guard
//!
//! Lock-free accounting of the broadcast queue's length. The queue itself is
//! unbounded: producers are never refused and never blocked. The guard makes
//! the backlog observable and raises a warning when it crosses a configured
//! high-water mark, so that an operator can see sustained overload before it
//! turns into memory exhaustion.
//!
//! ## Accounting
//!
//! - `increment` is called by producers right before an event is enqueued.
//! - `decrement` is called by the dispatcher thread right after dequeue.
//! - A warning is logged once per excursion above the mark; it is re-armed
//!   when the backlog falls below half the mark.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// # Queue Guard
///
/// Shared counter for in-flight broadcast events.
#[derive(Debug)]
pub struct QueueGuard {
    /// Backlog size above which a warning is emitted. Zero disables the warning.
    high_water: usize,
    /// Number of events enqueued but not yet dequeued.
    current: AtomicUsize,
    /// Set while the backlog is above the mark and the warning has fired.
    alarmed: AtomicBool,
}

impl QueueGuard {
    /// Creates a guard with the given high-water mark.
    pub fn new(high_water: usize) -> Self {
        Self {
            high_water,
            current: AtomicUsize::new(0),
            alarmed: AtomicBool::new(false),
        }
    }

    /// # Increment
    ///
    /// Records one more pending event.
    ///
    /// # Returns
    /// - `true` while the backlog is within the high-water mark.
    /// - `false` once it has been exceeded. The event is still accepted.
    pub fn increment(&self) -> bool {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        if self.high_water == 0 || now <= self.high_water {
            return true;
        }
        if !self.alarmed.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Broadcast queue length {} exceeded high-water mark {}",
                now,
                self.high_water
            );
        }
        false
    }

    /// Records that one event left the queue.
    pub fn decrement(&self) {
        // Saturating: a sentinel pushed by `stop` is never counted.
        let prev = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if prev.saturating_sub(1) < self.high_water / 2 && self.alarmed.swap(false, Ordering::Relaxed) {
            log::info!("Broadcast queue drained below {}", self.high_water / 2);
        }
    }

    /// Current backlog.
    pub fn len(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured high-water mark.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Backlog as a percentage of the high-water mark.
    pub fn usage_percent(&self) -> f64 {
        if self.high_water == 0 {
            0.0
        } else {
            (self.len() as f64 / self.high_water as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_flags_the_mark() {
        let guard = QueueGuard::new(2);
        assert!(guard.increment());
        assert!(guard.increment());
        assert!(!guard.increment());
        assert_eq!(guard.len(), 3);
        assert_eq!(guard.usage_percent(), 150.0);

        guard.decrement();
        guard.decrement();
        guard.decrement();
        assert!(guard.is_empty());
        guard.decrement();
        assert_eq!(guard.len(), 0);
    }

    #[test]
    fn zero_mark_never_alarms() {
        let guard = QueueGuard::new(0);
        for _ in 0..1000 {
            assert!(guard.increment());
        }
        assert_eq!(guard.usage_percent(), 0.0);
    }
}
