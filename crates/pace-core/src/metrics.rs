use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use crate::subscription::SubscriptionName;

/// OTel instruments for rate control. Created once per node and shared by
/// every controller, negotiation client and the balancer.
pub struct Metrics {
    pub output_rate: Gauge<f64>,
    pub limiter_mode: Gauge<u64>,
    pub negotiated_max_rate: Gauge<f64>,
    pub observed_rate: Gauge<f64>,
    pub history_failures: Counter<u64>,
    pub max_rate_fetch_failures: Counter<u64>,
    pub balancer_runs: Counter<u64>,
    pub balancer_updates: Counter<u64>,
    pub balancer_write_failures: Counter<u64>,
    pub balancer_read_failures: Counter<u64>,
    pub balancer_pruned_consumers: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn subscription_attr(subscription: &SubscriptionName) -> KeyValue {
    KeyValue::new("subscription", subscription.qualified())
}

fn pair_attrs(subscription: &SubscriptionName, consumer_id: &str) -> [KeyValue; 2] {
    [
        subscription_attr(subscription),
        KeyValue::new("consumer_id", consumer_id.to_string()),
    ]
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured, the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("pace");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            output_rate: meter
                .f64_gauge("pace.limiter.output_rate")
                .with_description("Current local delivery rate (messages/s)")
                .build(),
            limiter_mode: meter
                .u64_gauge("pace.limiter.mode")
                .with_description("Output-rate mode: 0 normal, 1 slow, 2 heartbeat")
                .build(),
            negotiated_max_rate: meter
                .f64_gauge("pace.negotiation.max_rate")
                .with_description("Ceiling currently in force for this consumer")
                .build(),
            observed_rate: meter
                .f64_gauge("pace.negotiation.observed_rate")
                .with_description("Send attempts per second observed at the last negotiation tick")
                .build(),
            history_failures: meter
                .u64_counter("pace.negotiation.history_failures")
                .with_description("Failed rate-history updates")
                .build(),
            max_rate_fetch_failures: meter
                .u64_counter("pace.negotiation.max_rate_fetch_failures")
                .with_description("Failed max-rate reads (fallback ceiling applied)")
                .build(),
            balancer_runs: meter
                .u64_counter("pace.balancer.runs")
                .with_description("Balancing runs executed by the leader")
                .build(),
            balancer_updates: meter
                .u64_counter("pace.balancer.updates")
                .with_description("Max-rate values written by the balancer")
                .build(),
            balancer_write_failures: meter
                .u64_counter("pace.balancer.write_failures")
                .with_description("Failed max-rate writes")
                .build(),
            balancer_read_failures: meter
                .u64_counter("pace.balancer.read_failures")
                .with_description("Subscriptions skipped because store reads failed")
                .build(),
            balancer_pruned_consumers: meter
                .u64_counter("pace.balancer.pruned_consumers")
                .with_description("Stale consumer entries removed from the store")
                .build(),
        }
    }

    pub fn set_output_rate(&self, subscription: &SubscriptionName, rate: f64) {
        self.output_rate
            .record(rate, &[subscription_attr(subscription)]);
    }

    pub fn set_limiter_mode(&self, subscription: &SubscriptionName, mode: u64) {
        self.limiter_mode
            .record(mode, &[subscription_attr(subscription)]);
    }

    pub fn set_negotiated_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        max_rate: f64,
    ) {
        self.negotiated_max_rate
            .record(max_rate, &pair_attrs(subscription, consumer_id));
    }

    pub fn set_observed_rate(&self, subscription: &SubscriptionName, consumer_id: &str, rate: f64) {
        self.observed_rate
            .record(rate, &pair_attrs(subscription, consumer_id));
    }

    pub fn record_history_failure(&self, subscription: &SubscriptionName, consumer_id: &str) {
        self.history_failures
            .add(1, &pair_attrs(subscription, consumer_id));
    }

    pub fn record_max_rate_fetch_failure(&self, subscription: &SubscriptionName, consumer_id: &str) {
        self.max_rate_fetch_failures
            .add(1, &pair_attrs(subscription, consumer_id));
    }

    pub fn record_balancer_run(&self) {
        self.balancer_runs.add(1, &[]);
    }

    pub fn record_balancer_update(&self, subscription: &SubscriptionName) {
        self.balancer_updates
            .add(1, &[subscription_attr(subscription)]);
    }

    pub fn record_balancer_write_failure(&self, subscription: &SubscriptionName) {
        self.balancer_write_failures
            .add(1, &[subscription_attr(subscription)]);
    }

    pub fn record_balancer_read_failure(&self, subscription: &SubscriptionName) {
        self.balancer_read_failures
            .add(1, &[subscription_attr(subscription)]);
    }

    pub fn record_pruned_consumer(&self, subscription: &SubscriptionName) {
        self.balancer_pruned_consumers
            .add(1, &[subscription_attr(subscription)]);
    }
}
