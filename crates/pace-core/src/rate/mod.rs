pub mod bucket;
pub mod calculator;
pub mod controller;
pub mod counters;
pub mod history;
pub mod negotiation;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use bucket::PermitBucket;
pub use calculator::{Mode, OutputRateCalculator, RateCalculation};
pub use controller::{LocalRateController, RateControllerFactory};
pub use counters::{CountersSnapshot, UtilizationCounters};
pub use history::RateHistory;
pub use negotiation::{compute_utilization, NegotiationClient};

/// Ceiling on one consumer's delivery rate for one subscription, in messages
/// per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MaxRate {
    max_rate: f64,
}

impl MaxRate {
    /// Negative and NaN inputs become 0.0.
    pub fn new(max_rate: f64) -> Self {
        let max_rate = if max_rate.is_nan() { 0.0 } else { max_rate.max(0.0) };
        Self { max_rate }
    }

    pub fn value(self) -> f64 {
        self.max_rate
    }

    /// Whether a decoded value is usable as a ceiling.
    pub fn is_valid(self) -> bool {
        self.max_rate.is_finite() && self.max_rate >= 0.0
    }
}

/// An `f64` shared between delivery threads and tick threads.
#[derive(Debug)]
pub struct AtomicRate(AtomicU64);

impl AtomicRate {
    pub fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Release);
    }
}
