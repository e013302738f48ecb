use crate::config::LimiterConfig;
use crate::rate::counters::CountersSnapshot;

/// Output-rate mode of a local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Rate converges toward the negotiated ceiling.
    Normal,
    /// The subscriber is failing; rate is cut on every failing window.
    Slow,
    /// Backoff bottomed out; retry at the heartbeat rate until a send succeeds.
    Heartbeat,
}

impl Mode {
    /// Numeric encoding for the mode gauge.
    pub fn gauge_value(self) -> u64 {
        match self {
            Mode::Normal => 0,
            Mode::Slow => 1,
            Mode::Heartbeat => 2,
        }
    }
}

/// Result of one recalculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCalculation {
    pub rate: f64,
    pub mode: Mode,
}

/// Within this fraction of the target, the rate snaps to the target.
const SNAP_FRACTION: f64 = 0.01;

/// Feedback policy turning one window of send outcomes into the next rate.
///
/// - `Normal`: close `convergence_factor` of the gap to
///   `max_rate * success_ratio` each window, never exceeding `max_rate`.
/// - A window whose failure ratio exceeds `failure_ratio_threshold` multiplies
///   the rate by `slow_mode_backoff` and enters `Slow`.
/// - Once the cut rate reaches `heartbeat_rate`, enter `Heartbeat`.
/// - Any window with successes and no failing ratio returns to `Normal`.
#[derive(Debug, Clone)]
pub struct OutputRateCalculator {
    failure_ratio_threshold: f64,
    convergence_factor: f64,
    slow_mode_backoff: f64,
    heartbeat_rate: f64,
}

impl OutputRateCalculator {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            failure_ratio_threshold: config.failure_ratio_threshold,
            convergence_factor: config.convergence_factor,
            slow_mode_backoff: config.slow_mode_backoff,
            heartbeat_rate: config.heartbeat_rate.max(0.0),
        }
    }

    pub fn recalculate(
        &self,
        counters: &CountersSnapshot,
        mode: Mode,
        current_rate: f64,
        max_rate: f64,
    ) -> RateCalculation {
        let max_rate = if max_rate.is_nan() { 0.0 } else { max_rate.max(0.0) };
        let current_rate = if current_rate.is_nan() {
            0.0
        } else {
            current_rate.max(0.0)
        };

        let failing =
            counters.outcomes() > 0 && counters.failure_ratio() > self.failure_ratio_threshold;
        let recovered = counters.succeeded > 0 && !failing;

        match mode {
            Mode::Normal if failing => self.slow_down(current_rate, max_rate),
            Mode::Normal => self.converge(counters, current_rate, max_rate),
            Mode::Slow if failing => self.slow_down(current_rate, max_rate),
            Mode::Slow if recovered => self.converge(counters, current_rate, max_rate),
            Mode::Slow => RateCalculation {
                rate: current_rate.min(max_rate),
                mode: Mode::Slow,
            },
            Mode::Heartbeat if recovered => self.converge(counters, current_rate, max_rate),
            Mode::Heartbeat => RateCalculation {
                rate: self.heartbeat_rate.min(max_rate),
                mode: Mode::Heartbeat,
            },
        }
    }

    fn converge(&self, counters: &CountersSnapshot, current: f64, max_rate: f64) -> RateCalculation {
        let target = max_rate * counters.success_ratio();
        let mut rate = current + (target - current) * self.convergence_factor;
        if (target - rate).abs() <= target * SNAP_FRACTION {
            rate = target;
        }
        RateCalculation {
            rate: rate.clamp(0.0, max_rate),
            mode: Mode::Normal,
        }
    }

    fn slow_down(&self, current: f64, max_rate: f64) -> RateCalculation {
        let rate = current * self.slow_mode_backoff;
        if rate <= self.heartbeat_rate {
            RateCalculation {
                rate: self.heartbeat_rate.min(max_rate),
                mode: Mode::Heartbeat,
            }
        } else {
            RateCalculation {
                rate: rate.min(max_rate),
                mode: Mode::Slow,
            }
        }
    }
}
