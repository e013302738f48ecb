use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{LimiterConfig, NegotiationConfig};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::rate::bucket::PermitBucket;
use crate::rate::calculator::{Mode, OutputRateCalculator, RateCalculation};
use crate::rate::counters::{CountersSnapshot, UtilizationCounters};
use crate::rate::negotiation::NegotiationClient;
use crate::rate::AtomicRate;
use crate::store::MaxRateStore;
use crate::subscription::{Subscription, SubscriptionName};
use crate::supervisor::{Registration, SupervisorHandle, Tick};

/// Longest single wait inside [`LocalRateController::acquire`]. Bounds how
/// long a waiter takes to notice a rate change.
const MAX_PARK: Duration = Duration::from_millis(100);

struct ControllerState {
    mode: Mode,
    registration: Option<Registration>,
}

/// Gates message delivery for one subscription on this consumer.
///
/// Delivery threads call [`acquire`](Self::acquire) before each send and
/// report the outcome afterwards. The rate supervisor calls
/// [`adjust_consumer_rate`](Self::adjust_consumer_rate) once per window,
/// which feeds the window's outcomes and the negotiated ceiling into the
/// calculator and applies the result to the permit bucket.
pub struct LocalRateController {
    name: SubscriptionName,
    subscription: RwLock<Subscription>,
    consumer_id: String,
    bucket: Mutex<PermitBucket>,
    rate: AtomicRate,
    state: Mutex<ControllerState>,
    counters: Arc<UtilizationCounters>,
    calculator: OutputRateCalculator,
    negotiation: Arc<NegotiationClient>,
    supervisor: SupervisorHandle,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl LocalRateController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription: Subscription,
        consumer_id: impl Into<String>,
        counters: Arc<UtilizationCounters>,
        negotiation: Arc<NegotiationClient>,
        supervisor: SupervisorHandle,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        config: &LimiterConfig,
    ) -> Self {
        let calculator = OutputRateCalculator::new(config);
        let initial =
            calculator.recalculate(&CountersSnapshot::EMPTY, Mode::Normal, 0.0, negotiation.get());
        let bucket = PermitBucket::new(initial.rate, config.burst_seconds, clock.now());
        Self {
            name: subscription.name.clone(),
            subscription: RwLock::new(subscription),
            consumer_id: consumer_id.into(),
            bucket: Mutex::new(bucket),
            rate: AtomicRate::new(initial.rate),
            state: Mutex::new(ControllerState {
                mode: initial.mode,
                registration: None,
            }),
            counters,
            calculator,
            negotiation,
            supervisor,
            metrics,
            clock,
        }
    }

    pub fn name(&self) -> &SubscriptionName {
        &self.name
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Current subscription metadata.
    pub fn subscription(&self) -> Subscription {
        self.subscription
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Local delivery rate currently enforced, in messages per second.
    pub fn rate(&self) -> f64 {
        self.rate.load()
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).mode
    }

    /// Ceiling in force from the negotiation client.
    pub fn max_rate(&self) -> f64 {
        self.negotiation.get()
    }

    pub fn counters(&self) -> &UtilizationCounters {
        &self.counters
    }

    fn registration_key(&self) -> String {
        self.name.qualified()
    }

    /// Start negotiating, apply the first rate, and register for periodic
    /// recalculation. On failure nothing stays registered.
    #[tracing::instrument(skip_all, fields(subscription = %self.name))]
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        self.negotiation.start()?;
        self.adjust_consumer_rate();
        match self
            .supervisor
            .register(self.registration_key(), self.clone())
        {
            Ok(registration) => {
                self.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .registration = Some(registration);
            }
            Err(e) => {
                self.negotiation.shutdown();
                return Err(e);
            }
        }
        info!(rate = self.rate(), max_rate = self.max_rate(), "rate controller initialized");
        Ok(())
    }

    /// Stop periodic recalculation and negotiation. Only undoes what this
    /// controller registered itself.
    #[tracing::instrument(skip_all, fields(subscription = %self.name))]
    pub fn shutdown(&self) {
        let registration = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .registration
            .take();
        if let Some(registration) = registration {
            self.supervisor.unregister(&registration);
        }
        self.negotiation.shutdown();
        info!("rate controller stopped");
    }

    /// Block until a send permit is available, then count the attempt.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.refill(self.clock.now());
                if bucket.try_consume(1.0) {
                    break;
                }
                bucket.time_until(1.0).map_or(MAX_PARK, |d| d.min(MAX_PARK))
            };
            thread::sleep(wait);
        }
        self.counters.increment_attempted();
    }

    /// Take a permit if one is available right now. Counts the attempt only
    /// when a permit was granted.
    pub fn try_acquire(&self) -> bool {
        let granted = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.refill(self.clock.now());
            bucket.try_consume(1.0)
        };
        if granted {
            self.counters.increment_attempted();
        }
        granted
    }

    pub fn register_successful_sending(&self) {
        self.counters.increment_succeeded();
    }

    pub fn register_failed_sending(&self) {
        self.counters.increment_failed();
    }

    /// Close the current window: recompute the rate from its outcomes and
    /// the negotiated ceiling, apply it, and start a fresh window.
    pub fn adjust_consumer_rate(&self) {
        let window = self.counters.reset();
        let max_rate = self.negotiation.get();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous_mode = state.mode;
        let RateCalculation { rate, mode } =
            self.calculator
                .recalculate(&window, previous_mode, self.rate.load(), max_rate);

        {
            let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
            // Settle permits earned at the old rate before switching.
            bucket.refill(self.clock.now());
            bucket.set_rate(rate);
        }
        self.rate.store(rate);
        state.mode = mode;
        drop(state);

        self.metrics.set_output_rate(&self.name, rate);
        self.metrics.set_limiter_mode(&self.name, mode.gauge_value());

        if mode != previous_mode {
            info!(
                subscription = %self.name,
                from = ?previous_mode,
                to = ?mode,
                rate,
                failure_ratio = window.failure_ratio(),
                "output rate mode changed"
            );
        } else {
            debug!(
                subscription = %self.name,
                rate,
                max_rate,
                attempted = window.attempted,
                succeeded = window.succeeded,
                failed = window.failed,
                "output rate recalculated"
            );
        }
    }

    /// Swap subscription metadata. The subscription name is the controller's
    /// identity; metadata for a different name is ignored.
    pub fn update_subscription_metadata(&self, subscription: Subscription) {
        if subscription.name != self.name {
            warn!(
                subscription = %self.name,
                other = %subscription.name,
                "ignoring metadata update for a different subscription"
            );
            return;
        }
        *self
            .subscription
            .write()
            .unwrap_or_else(|e| e.into_inner()) = subscription;
    }
}

impl Tick for LocalRateController {
    fn tick(&self) {
        self.adjust_consumer_rate();
    }
}

impl PartialEq for LocalRateController {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for LocalRateController {}

impl Hash for LocalRateController {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Everything needed to build controllers for this consumer: shared store,
/// metrics, clock, tuning, and the two supervisors that drive them.
#[derive(Clone)]
pub struct RateControllerFactory {
    consumer_id: String,
    store: Arc<dyn MaxRateStore>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    limiter: LimiterConfig,
    negotiation: NegotiationConfig,
    rate_supervisor: SupervisorHandle,
    negotiation_supervisor: SupervisorHandle,
}

impl RateControllerFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer_id: impl Into<String>,
        store: Arc<dyn MaxRateStore>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        limiter: LimiterConfig,
        negotiation: NegotiationConfig,
        rate_supervisor: SupervisorHandle,
        negotiation_supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            store,
            metrics,
            clock,
            limiter,
            negotiation,
            rate_supervisor,
            negotiation_supervisor,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Build an uninitialized controller for `subscription`.
    pub fn create(&self, subscription: Subscription) -> Arc<LocalRateController> {
        let counters = Arc::new(UtilizationCounters::new(self.clock.clone()));
        let negotiation = Arc::new(NegotiationClient::new(
            subscription.name.clone(),
            self.consumer_id.clone(),
            self.store.clone(),
            counters.clone(),
            self.metrics.clone(),
            self.negotiation_supervisor.clone(),
            &self.negotiation,
        ));
        Arc::new(LocalRateController::new(
            subscription,
            self.consumer_id.clone(),
            counters,
            negotiation,
            self.rate_supervisor.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            &self.limiter,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate::MaxRate;
    use crate::store::{CoordinatedMaxRateStore, MemoryCoordinator};
    use crate::supervisor::PeriodicSupervisor;
    use std::collections::HashSet;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<CoordinatedMaxRateStore>,
        factory: RateControllerFactory,
        _rate: PeriodicSupervisor,
        _negotiation: PeriodicSupervisor,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let store = Arc::new(CoordinatedMaxRateStore::new(
                Arc::new(MemoryCoordinator::new()),
                "/pace",
                3,
            ));
            // Long intervals: tests drive every tick by hand.
            let rate = PeriodicSupervisor::spawn("test-rate", Duration::from_secs(3600)).unwrap();
            let negotiation =
                PeriodicSupervisor::spawn("test-neg", Duration::from_secs(3600)).unwrap();
            let factory = RateControllerFactory::new(
                "c1",
                store.clone(),
                Arc::new(Metrics::new()),
                clock.clone(),
                LimiterConfig {
                    heartbeat_rate: 0.5,
                    ..LimiterConfig::default()
                },
                NegotiationConfig::default(),
                rate.handle(),
                negotiation.handle(),
            );
            Self {
                clock,
                store,
                factory,
                _rate: rate,
                _negotiation: negotiation,
            }
        }

        fn subscription() -> Subscription {
            Subscription::new(SubscriptionName::new("orders", "billing"), 1000.0)
        }

        fn controller(&self) -> Arc<LocalRateController> {
            self.factory.create(Self::subscription())
        }

        /// Run one window of `succeeded` / `failed` sends, then recalculate.
        fn window(&self, controller: &LocalRateController, succeeded: u32, failed: u32) {
            for _ in 0..succeeded {
                controller.counters().increment_attempted();
                controller.register_successful_sending();
            }
            for _ in 0..failed {
                controller.counters().increment_attempted();
                controller.register_failed_sending();
            }
            self.clock.advance(Duration::from_secs(1));
            controller.adjust_consumer_rate();
        }
    }

    #[test]
    fn initial_rate_derived_from_fallback_ceiling() {
        let fx = Fixture::new();
        let controller = fx.controller();
        assert_eq!(controller.mode(), Mode::Normal);
        assert_eq!(controller.rate(), 50.0);
        assert_eq!(controller.max_rate(), 100.0);
    }

    #[test]
    fn successful_windows_converge_to_ceiling() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let mut previous = controller.rate();
        for _ in 0..10 {
            fx.window(&controller, 10, 0);
            assert!(controller.rate() >= previous);
            assert!(controller.rate() <= 100.0);
            previous = controller.rate();
        }
        assert_eq!(controller.rate(), 100.0);
    }

    #[test]
    fn failures_slow_down_then_recover() {
        let fx = Fixture::new();
        let controller = fx.controller();
        for _ in 0..10 {
            fx.window(&controller, 10, 0);
        }
        fx.window(&controller, 0, 10);
        assert_eq!(controller.mode(), Mode::Slow);
        assert_eq!(controller.rate(), 50.0);

        fx.window(&controller, 10, 0);
        assert_eq!(controller.mode(), Mode::Normal);
        assert!(controller.rate() > 50.0);
    }

    #[test]
    fn sustained_failures_reach_heartbeat() {
        let fx = Fixture::new();
        let controller = fx.controller();
        for _ in 0..20 {
            fx.window(&controller, 0, 5);
        }
        assert_eq!(controller.mode(), Mode::Heartbeat);
        assert_eq!(controller.rate(), 0.5);
    }

    #[test]
    fn negotiated_ceiling_applies_on_next_window() {
        let fx = Fixture::new();
        let controller = fx.controller();
        for _ in 0..10 {
            fx.window(&controller, 10, 0);
        }
        fx.store
            .write_max_rate(controller.name(), "c1", MaxRate::new(20.0))
            .unwrap();
        controller.negotiation.tick_for_history();
        fx.window(&controller, 10, 0);
        assert_eq!(controller.rate(), 20.0);
    }

    #[test]
    fn zero_ceiling_halts_delivery() {
        let fx = Fixture::new();
        let controller = fx.controller();
        fx.store
            .write_max_rate(controller.name(), "c1", MaxRate::new(0.0))
            .unwrap();
        controller.negotiation.tick_for_history();
        fx.window(&controller, 0, 0);
        assert_eq!(controller.rate(), 0.0);

        // Drain whatever was buffered, then nothing more is granted.
        while controller.try_acquire() {}
        fx.clock.advance(Duration::from_secs(60));
        assert!(!controller.try_acquire());
    }

    #[test]
    fn try_acquire_respects_bucket_and_counts_attempts() {
        let fx = Fixture::new();
        let controller = fx.controller();
        // Starts with a single permit.
        assert!(controller.try_acquire());
        assert!(!controller.try_acquire());

        fx.clock.advance(Duration::from_millis(110));
        // 50 msg/s for 110ms.
        let mut granted = 0;
        while controller.try_acquire() {
            granted += 1;
        }
        assert_eq!(granted, 5);
        assert_eq!(controller.counters().snapshot().attempted, 6);
    }

    #[test]
    fn acquire_blocks_until_permit_refills() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let fx = Fixture::new();
        let factory = RateControllerFactory {
            clock,
            ..fx.factory.clone()
        };
        let controller = factory.create(Fixture::subscription());

        let start = std::time::Instant::now();
        controller.acquire();
        controller.acquire();
        // Second permit at 50 msg/s takes about 20ms.
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(controller.counters().snapshot().attempted, 2);
    }

    #[test]
    fn metadata_swapped_but_identity_kept() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let mut updated = Fixture::subscription();
        updated.rate_limit = 10.0;
        controller.update_subscription_metadata(updated.clone());
        assert_eq!(controller.subscription(), updated);

        let other = Subscription::new(SubscriptionName::new("orders", "other"), 1.0);
        controller.update_subscription_metadata(other);
        assert_eq!(controller.subscription(), updated);
    }

    #[test]
    fn initialize_rejects_second_controller_for_same_subscription() {
        let fx = Fixture::new();
        let first = fx.controller();
        first.initialize().unwrap();

        let second = fx.controller();
        assert!(second.initialize().is_err());
        // The first keeps its registrations.
        first.shutdown();
        second.initialize().unwrap();
        second.shutdown();
    }

    #[test]
    fn rejected_duplicate_shutdown_keeps_live_registrations() {
        let fx = Fixture::new();
        let live = fx.controller();
        live.initialize().unwrap();

        let duplicate = fx.controller();
        assert!(duplicate.initialize().is_err());
        duplicate.shutdown();

        // Both keys still belong to the live controller.
        let err = fx
            ._rate
            .handle()
            .register("orders$billing", duplicate.clone())
            .unwrap_err();
        assert!(matches!(err, crate::error::PaceError::DuplicateRegistration(_)));
        let third = fx.controller();
        assert!(third.initialize().is_err());

        live.shutdown();
        third.initialize().unwrap();
        third.shutdown();
    }

    #[test]
    fn equality_by_subscription_name() {
        let fx = Fixture::new();
        let a = fx.controller();
        let b = fx.controller();
        assert!(*a == *b);
        let set: HashSet<Arc<LocalRateController>> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}
