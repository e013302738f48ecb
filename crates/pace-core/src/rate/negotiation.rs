use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::NegotiationConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::rate::counters::UtilizationCounters;
use crate::rate::{AtomicRate, MaxRate};
use crate::store::MaxRateStore;
use crate::subscription::SubscriptionName;
use crate::supervisor::{Registration, SupervisorHandle, Tick};

/// Fraction of `max_rate` actually used at `observed_rate`, in [0, 1].
/// A ceiling below 1 msg/s counts as 1 so idle consumers near zero are not
/// reported as saturated.
pub fn compute_utilization(observed_rate: f64, max_rate: f64) -> f64 {
    if !observed_rate.is_finite() || observed_rate <= 0.0 {
        return 0.0;
    }
    let ceiling = if max_rate.is_nan() { 1.0 } else { max_rate.max(1.0) };
    (observed_rate / ceiling).min(1.0)
}

/// Per-(subscription, consumer) agent that publishes utilization to the store
/// and pulls back the ceiling assigned by the balancer.
///
/// [`NegotiationClient::get`] never blocks and never fails: the ceiling is
/// cached and replaced on every tick, with the configured fallback whenever
/// the store has nothing usable.
pub struct NegotiationClient {
    subscription: SubscriptionName,
    consumer_id: String,
    store: Arc<dyn MaxRateStore>,
    counters: Arc<UtilizationCounters>,
    metrics: Arc<Metrics>,
    supervisor: SupervisorHandle,
    registration: Mutex<Option<Registration>>,
    history_limit: usize,
    fallback: MaxRate,
    max_rate: AtomicRate,
}

impl NegotiationClient {
    pub fn new(
        subscription: SubscriptionName,
        consumer_id: impl Into<String>,
        store: Arc<dyn MaxRateStore>,
        counters: Arc<UtilizationCounters>,
        metrics: Arc<Metrics>,
        supervisor: SupervisorHandle,
        config: &NegotiationConfig,
    ) -> Self {
        let fallback = MaxRate::new(config.fallback_max_rate);
        Self {
            subscription,
            consumer_id: consumer_id.into(),
            store,
            counters,
            metrics,
            supervisor,
            registration: Mutex::new(None),
            history_limit: config.history_limit.max(1),
            fallback,
            max_rate: AtomicRate::new(fallback.value()),
        }
    }

    /// Ceiling currently in force.
    pub fn get(&self) -> f64 {
        self.max_rate.load()
    }

    pub fn subscription(&self) -> &SubscriptionName {
        &self.subscription
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn registration_key(&self) -> String {
        format!("{}/{}", self.subscription.qualified(), self.consumer_id)
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let registration = self
            .supervisor
            .register(self.registration_key(), self.clone())?;
        *self.registration.lock().unwrap_or_else(|e| e.into_inner()) = Some(registration);
        self.metrics
            .set_negotiated_max_rate(&self.subscription, &self.consumer_id, self.get());
        debug!(subscription = %self.subscription, consumer_id = %self.consumer_id, "negotiation started");
        Ok(())
    }

    /// Stop ticking. A client that never started leaves the supervisor alone.
    pub fn shutdown(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(registration) = registration else {
            return;
        };
        if self.supervisor.unregister(&registration) {
            debug!(subscription = %self.subscription, consumer_id = %self.consumer_id, "negotiation stopped");
        }
    }

    /// One negotiation round: append the current utilization to the shared
    /// history, then refresh the cached ceiling.
    pub fn tick_for_history(&self) {
        let observed = self.counters.rate();
        self.metrics
            .set_observed_rate(&self.subscription, &self.consumer_id, observed);
        self.record_utilization(compute_utilization(observed, self.get()));

        let max_rate = self.fetch_or_fallback();
        self.max_rate.store(max_rate);
        self.metrics
            .set_negotiated_max_rate(&self.subscription, &self.consumer_id, max_rate);
    }

    fn record_utilization(&self, utilization: f64) {
        let limit = self.history_limit;
        match self.store.update_history(
            &self.subscription,
            &self.consumer_id,
            &|history| history.updated(utilization, limit),
        ) {
            Ok(history) => debug!(
                subscription = %self.subscription,
                consumer_id = %self.consumer_id,
                utilization,
                entries = history.len(),
                "rate history updated"
            ),
            Err(e) => {
                self.metrics
                    .record_history_failure(&self.subscription, &self.consumer_id);
                warn!(
                    subscription = %self.subscription,
                    consumer_id = %self.consumer_id,
                    error = %e,
                    "failed to update rate history"
                );
            }
        }
    }

    fn fetch_or_fallback(&self) -> f64 {
        match self
            .store
            .read_max_rate(&self.subscription, &self.consumer_id)
        {
            Ok(Some(max_rate)) => max_rate.value(),
            Ok(None) => {
                debug!(
                    subscription = %self.subscription,
                    consumer_id = %self.consumer_id,
                    fallback = self.fallback.value(),
                    "no max rate assigned yet, using fallback"
                );
                self.fallback.value()
            }
            Err(e) => {
                self.metrics
                    .record_max_rate_fetch_failure(&self.subscription, &self.consumer_id);
                warn!(
                    subscription = %self.subscription,
                    consumer_id = %self.consumer_id,
                    error = %e,
                    fallback = self.fallback.value(),
                    "failed to fetch max rate, using fallback"
                );
                self.fallback.value()
            }
        }
    }
}

impl Tick for NegotiationClient {
    fn tick(&self) {
        self.tick_for_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::test_harness::{pair, MetricTestHarness};
    use crate::rate::RateHistory;
    use crate::store::{CoordinatedMaxRateStore, MemoryCoordinator};
    use crate::supervisor::PeriodicSupervisor;
    use opentelemetry::metrics::MeterProvider as _;
    use std::time::Duration;

    struct Fixture {
        harness: MetricTestHarness,
        clock: Arc<ManualClock>,
        coordinator: Arc<MemoryCoordinator>,
        store: Arc<CoordinatedMaxRateStore>,
        counters: Arc<UtilizationCounters>,
        supervisor: PeriodicSupervisor,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let coordinator = Arc::new(MemoryCoordinator::new());
            Self {
                harness: MetricTestHarness::new(),
                counters: Arc::new(UtilizationCounters::new(clock.clone())),
                clock,
                store: Arc::new(CoordinatedMaxRateStore::new(coordinator.clone(), "/pace", 3)),
                coordinator,
                supervisor: PeriodicSupervisor::spawn("test-negotiation", Duration::from_secs(3600))
                    .unwrap(),
            }
        }

        fn client(&self, history_limit: usize) -> Arc<NegotiationClient> {
            let meter = self.harness.meter_provider.meter("negotiation-test");
            let metrics = Arc::new(Metrics::from_meter(&meter));
            Arc::new(NegotiationClient::new(
                SubscriptionName::new("orders", "billing"),
                "c1",
                self.store.clone(),
                self.counters.clone(),
                metrics,
                self.supervisor.handle(),
                &NegotiationConfig {
                    history_limit,
                    fallback_max_rate: 100.0,
                    ..NegotiationConfig::default()
                },
            ))
        }

        fn history(&self) -> Option<RateHistory> {
            self.store
                .read_history(&SubscriptionName::new("orders", "billing"), "c1")
                .unwrap()
        }
    }

    #[test]
    fn utilization_formula() {
        assert_eq!(compute_utilization(50.0, 100.0), 0.5);
        assert_eq!(compute_utilization(150.0, 100.0), 1.0);
        assert_eq!(compute_utilization(0.0, 100.0), 0.0);
        // Ceilings below one message per second count as one.
        assert_eq!(compute_utilization(0.25, 0.0), 0.25);
        assert_eq!(compute_utilization(f64::NAN, 10.0), 0.0);
    }

    #[test]
    fn starts_at_fallback() {
        let fx = Fixture::new();
        assert_eq!(fx.client(1).get(), 100.0);
    }

    #[test]
    fn tick_records_utilization_and_adopts_assigned_rate() {
        let fx = Fixture::new();
        let client = fx.client(3);
        for _ in 0..50 {
            fx.counters.increment_attempted();
        }
        fx.clock.advance(Duration::from_secs(1));
        fx.store
            .write_max_rate(client.subscription(), "c1", MaxRate::new(40.0))
            .unwrap();

        client.tick_for_history();

        // 50 msg/s against the fallback ceiling of 100.
        let history = fx.history().unwrap();
        assert_eq!(history.rates().collect::<Vec<_>>(), vec![0.5]);
        assert_eq!(client.get(), 40.0);
        fx.harness
            .assert_gauge_f64("pace.negotiation.max_rate", &pair("orders$billing", "c1"), 40.0, 1e-9);
    }

    #[test]
    fn history_bounded_by_limit() {
        let fx = Fixture::new();
        let client = fx.client(2);
        for _ in 0..5 {
            client.tick_for_history();
        }
        assert_eq!(fx.history().unwrap().len(), 2);
    }

    #[test]
    fn store_failure_falls_back_and_counts() {
        let fx = Fixture::new();
        let client = fx.client(1);
        fx.store
            .write_max_rate(client.subscription(), "c1", MaxRate::new(40.0))
            .unwrap();
        client.tick_for_history();
        assert_eq!(client.get(), 40.0);

        fx.coordinator.set_available(false);
        client.tick_for_history();

        assert_eq!(client.get(), 100.0);
        let attrs = pair("orders$billing", "c1");
        fx.harness
            .assert_counter("pace.negotiation.history_failures", &attrs, 1);
        fx.harness
            .assert_counter("pace.negotiation.max_rate_fetch_failures", &attrs, 1);
    }

    #[test]
    fn start_and_shutdown_register_with_supervisor() {
        let fx = Fixture::new();
        let client = fx.client(1);
        client.start().unwrap();
        assert!(matches!(
            client.start(),
            Err(crate::error::PaceError::DuplicateRegistration(_))
        ));
        client.shutdown();
        client.start().unwrap();
        client.shutdown();
    }
}
