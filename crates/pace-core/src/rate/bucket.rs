use std::time::{Duration, Instant};

/// Token bucket gating sends for one controller.
///
/// Tokens are refilled continuously based on elapsed time since the last
/// refill. Capacity is `burst_seconds` worth of the current rate, but never
/// less than one permit so any positive rate can make progress. A rate of
/// zero means no permits are ever issued.
///
/// Not synchronized; the owning controller guards it.
#[derive(Debug)]
pub struct PermitBucket {
    tokens: f64,
    rate_per_second: f64,
    burst_seconds: f64,
    capacity: f64,
    last_refill: Instant,
}

fn capacity_for(rate_per_second: f64, burst_seconds: f64) -> f64 {
    if rate_per_second <= 0.0 {
        0.0
    } else {
        (rate_per_second * burst_seconds).max(1.0)
    }
}

impl PermitBucket {
    /// Create a bucket holding a single permit (or none at rate zero).
    /// Negative rates are clamped to 0.0.
    pub fn new(rate_per_second: f64, burst_seconds: f64, now: Instant) -> Self {
        let rate = rate_per_second.max(0.0);
        let burst_seconds = burst_seconds.max(0.0);
        let capacity = capacity_for(rate, burst_seconds);
        Self {
            tokens: capacity.min(1.0),
            rate_per_second: rate,
            burst_seconds,
            capacity,
            last_refill: now,
        }
    }

    /// Refill tokens based on elapsed time since last refill, capped at capacity.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Try to consume `n` tokens. Returns true and decrements if sufficient
    /// tokens are available; returns false without modification otherwise.
    pub fn try_consume(&mut self, n: f64) -> bool {
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens will be available at the current rate.
    /// `None` when the rate is zero and the bucket will never refill.
    pub fn time_until(&self, n: f64) -> Option<Duration> {
        let missing = n - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.rate_per_second <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(missing / self.rate_per_second))
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate_per_second
    }

    /// Change the rate. Preserves current tokens, clamped to the new capacity.
    pub fn set_rate(&mut self, rate_per_second: f64) {
        self.rate_per_second = rate_per_second.max(0.0);
        self.capacity = capacity_for(self.rate_per_second, self.burst_seconds);
        self.tokens = self.tokens.min(self.capacity);
    }
}
