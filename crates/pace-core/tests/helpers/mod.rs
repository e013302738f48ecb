#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pace_core::config::AssignmentConfig;
use pace_core::store::LeaderLatch;
use pace_core::{
    CoordinatedMaxRateStore, MaxRate, MaxRateStore, MemoryCoordinator, PaceConfig, RateHistory,
    StoreResult, SubscriptionName,
};

/// Config with intervals short enough for tests to observe several rounds.
pub fn fast_config(consumer_id: &str) -> PaceConfig {
    let mut config = PaceConfig::default();
    config.node.consumer_id = consumer_id.to_string();
    config.limiter.recalculation_interval_ms = 20;
    config.limiter.heartbeat_rate = 0.5;
    config.negotiation.update_interval_ms = 20;
    config.balancer.interval_ms = 30;
    config
}

pub fn assignment(topic: &str, name: &str, rate_limit: f64, consumers: &[&str]) -> AssignmentConfig {
    AssignmentConfig {
        topic: topic.to_string(),
        name: name.to_string(),
        rate_limit,
        consumers: consumers.iter().map(|c| c.to_string()).collect(),
    }
}

pub fn store_over(coordinator: &Arc<MemoryCoordinator>) -> Arc<CoordinatedMaxRateStore> {
    Arc::new(CoordinatedMaxRateStore::new(coordinator.clone(), "/pace", 3))
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Store wrapper counting max-rate writes, to see which node balanced.
pub struct CountingStore {
    inner: Arc<CoordinatedMaxRateStore>,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<CoordinatedMaxRateStore>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl MaxRateStore for CountingStore {
    fn read_or_create_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<RateHistory> {
        self.inner.read_or_create_history(subscription, consumer_id)
    }

    fn read_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<RateHistory>> {
        self.inner.read_history(subscription, consumer_id)
    }

    fn write_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        history: &RateHistory,
    ) -> StoreResult<()> {
        self.inner.write_history(subscription, consumer_id, history)
    }

    fn update_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        update: &dyn Fn(&RateHistory) -> RateHistory,
    ) -> StoreResult<RateHistory> {
        self.inner.update_history(subscription, consumer_id, update)
    }

    fn read_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<MaxRate>> {
        self.inner.read_max_rate(subscription, consumer_id)
    }

    fn write_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        max_rate: MaxRate,
    ) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_max_rate(subscription, consumer_id, max_rate)
    }

    fn list_consumers(&self, subscription: &SubscriptionName) -> StoreResult<BTreeSet<String>> {
        self.inner.list_consumers(subscription)
    }

    fn remove_consumer(&self, subscription: &SubscriptionName, consumer_id: &str) -> StoreResult<()> {
        self.inner.remove_consumer(subscription, consumer_id)
    }

    fn elect_leader(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch> {
        self.inner.elect_leader(path, candidate)
    }
}
