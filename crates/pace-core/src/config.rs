use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PaceError, Result};
use crate::subscription::{Subscription, SubscriptionName};

/// Top-level node configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaceConfig {
    pub node: NodeConfig,
    pub limiter: LimiterConfig,
    pub negotiation: NegotiationConfig,
    pub balancer: BalancerConfig,
    pub store: StoreConfig,
    /// Static assignment table used when no external assignment source is wired.
    pub subscriptions: Vec<AssignmentConfig>,
}

/// Identity of this process within the fleet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub consumer_id: String,
    /// Root path under which all coordination keys live.
    pub coordination_root: String,
}

/// Local output-rate controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub recalculation_interval_ms: u64,
    /// Failed / (succeeded + failed) above which a window counts as failing.
    pub failure_ratio_threshold: f64,
    /// Fraction of the gap to the target rate closed per recalculation.
    pub convergence_factor: f64,
    /// Multiplier applied to the rate on every failing window.
    pub slow_mode_backoff: f64,
    /// Rate used once backoff bottoms out.
    pub heartbeat_rate: f64,
    /// Permits the bucket may accumulate, expressed in seconds of current rate.
    pub burst_seconds: f64,
}

/// Per-consumer negotiation with the coordination store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub update_interval_ms: u64,
    pub history_limit: usize,
    /// Ceiling used whenever the negotiated one cannot be read.
    pub fallback_max_rate: f64,
    /// Compare-and-set attempts per history update.
    pub store_retries: u32,
}

/// Cluster-wide balancer tuning (only used on the elected leader).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub interval_ms: u64,
    pub busy_tolerance: f64,
    pub min_max_rate: f64,
    pub min_allowed_change_percent: f64,
    pub leader_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    RocksDb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub data_dir: PathBuf,
}

/// One `[[subscriptions]]` entry: a subscription and the consumers serving it.
#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentConfig {
    pub topic: String,
    pub name: String,
    pub rate_limit: f64,
    #[serde(default)]
    pub consumers: Vec<String>,
}

impl AssignmentConfig {
    pub fn subscription(&self) -> Subscription {
        Subscription::new(
            SubscriptionName::new(self.topic.clone(), self.name.clone()),
            self.rate_limit,
        )
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            consumer_id: uuid::Uuid::now_v7().to_string(),
            coordination_root: "/pace".to_string(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            recalculation_interval_ms: 1000,
            failure_ratio_threshold: 0.5,
            convergence_factor: 0.5,
            slow_mode_backoff: 0.5,
            heartbeat_rate: 1.0 / 60.0,
            burst_seconds: 1.0,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 5000,
            history_limit: 1,
            fallback_max_rate: 100.0,
            store_retries: 3,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            busy_tolerance: 0.8,
            min_max_rate: 1.0,
            min_allowed_change_percent: 1.0,
            leader_path: "max-rate-leader".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl LimiterConfig {
    pub fn recalculation_interval(&self) -> Duration {
        Duration::from_millis(self.recalculation_interval_ms)
    }
}

impl NegotiationConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl BalancerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(PaceError::InvalidConfig(format!(
            "{name} must be in (0, 1], got {value}"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PaceError::InvalidConfig(format!(
            "{name} must be a finite non-negative number, got {value}"
        )))
    }
}

fn positive_interval(name: &str, value: u64) -> Result<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(PaceError::InvalidConfig(format!("{name} must be > 0")))
    }
}

impl PaceConfig {
    /// Reject values that would make the control loop diverge or divide by zero.
    pub fn validate(&self) -> Result<()> {
        if self.node.consumer_id.is_empty() {
            return Err(PaceError::InvalidConfig(
                "node.consumer_id must not be empty".to_string(),
            ));
        }

        positive_interval(
            "limiter.recalculation_interval_ms",
            self.limiter.recalculation_interval_ms,
        )?;
        unit_interval(
            "limiter.failure_ratio_threshold",
            self.limiter.failure_ratio_threshold,
        )?;
        unit_interval("limiter.convergence_factor", self.limiter.convergence_factor)?;
        unit_interval("limiter.slow_mode_backoff", self.limiter.slow_mode_backoff)?;
        non_negative("limiter.heartbeat_rate", self.limiter.heartbeat_rate)?;
        if self.limiter.burst_seconds <= 0.0 {
            return Err(PaceError::InvalidConfig(
                "limiter.burst_seconds must be > 0".to_string(),
            ));
        }

        positive_interval(
            "negotiation.update_interval_ms",
            self.negotiation.update_interval_ms,
        )?;
        if self.negotiation.history_limit == 0 {
            return Err(PaceError::InvalidConfig(
                "negotiation.history_limit must be >= 1".to_string(),
            ));
        }
        non_negative(
            "negotiation.fallback_max_rate",
            self.negotiation.fallback_max_rate,
        )?;

        positive_interval("balancer.interval_ms", self.balancer.interval_ms)?;
        unit_interval("balancer.busy_tolerance", self.balancer.busy_tolerance)?;
        non_negative("balancer.min_max_rate", self.balancer.min_max_rate)?;
        non_negative(
            "balancer.min_allowed_change_percent",
            self.balancer.min_allowed_change_percent,
        )?;

        for entry in &self.subscriptions {
            non_negative(
                &format!("subscriptions[{}${}].rate_limit", entry.topic, entry.name),
                entry.rate_limit,
            )?;
        }

        Ok(())
    }
}
