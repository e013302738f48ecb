use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::Clock;

/// Counts observed in one recalculation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountersSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Attempts per second over the window.
    pub rate: f64,
}

impl CountersSnapshot {
    pub const EMPTY: CountersSnapshot = CountersSnapshot {
        attempted: 0,
        succeeded: 0,
        failed: 0,
        rate: 0.0,
    };

    /// Number of sends with a known outcome.
    pub fn outcomes(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Failed / outcomes, or 0.0 when nothing finished in the window.
    pub fn failure_ratio(&self) -> f64 {
        match self.outcomes() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }

    /// Succeeded / outcomes, or 1.0 when nothing finished in the window.
    pub fn success_ratio(&self) -> f64 {
        match self.outcomes() {
            0 => 1.0,
            n => self.succeeded as f64 / n as f64,
        }
    }
}

/// Per-(subscription, consumer) send counters.
///
/// Increments come from delivery threads, resets from the recalculation tick.
/// Each counter is swapped to zero atomically on reset, so an increment racing
/// with a reset lands in exactly one window.
pub struct UtilizationCounters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    window_start: Mutex<Instant>,
    clock: Arc<dyn Clock>,
}

/// Elapsed windows shorter than this are treated as this long.
const MIN_WINDOW_SECS: f64 = 1e-3;

impl UtilizationCounters {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window_start: Mutex::new(now),
            clock,
        }
    }

    pub fn increment_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Attempts per second since the last reset.
    pub fn rate(&self) -> f64 {
        let start = *self.window_start.lock().unwrap_or_else(|e| e.into_inner());
        let attempted = self.attempted.load(Ordering::Relaxed);
        Self::per_second(attempted, start, self.clock.now())
    }

    /// Read the current window without resetting it.
    pub fn snapshot(&self) -> CountersSnapshot {
        let start = *self.window_start.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let attempted = self.attempted.load(Ordering::Relaxed);
        CountersSnapshot {
            attempted,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate: Self::per_second(attempted, start, now),
        }
    }

    /// Zero all counters, restart the window, and return what the closed
    /// window contained.
    pub fn reset(&self) -> CountersSnapshot {
        let mut start = self.window_start.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let attempted = self.attempted.swap(0, Ordering::AcqRel);
        let succeeded = self.succeeded.swap(0, Ordering::AcqRel);
        let failed = self.failed.swap(0, Ordering::AcqRel);
        let rate = Self::per_second(attempted, *start, now);
        *start = now;
        CountersSnapshot {
            attempted,
            succeeded,
            failed,
            rate,
        }
    }

    fn per_second(count: u64, start: Instant, now: Instant) -> f64 {
        let elapsed = now
            .saturating_duration_since(start)
            .as_secs_f64()
            .max(MIN_WINDOW_SECS);
        count as f64 / elapsed
    }
}
