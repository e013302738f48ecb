mod helpers;

use std::sync::Arc;

use helpers::store_over;
use pace_core::balancer::{BalancerJob, MaxRateBalancer};
use pace_core::{
    MaxRateStore, MemoryCoordinator, Metrics, RateHistory, StaticAssignments, Subscription,
    SubscriptionName,
};

fn billing() -> SubscriptionName {
    SubscriptionName::new("orders", "billing")
}

struct Fixture {
    store: Arc<dyn MaxRateStore>,
    assignments: Arc<StaticAssignments>,
    job: BalancerJob,
}

impl Fixture {
    fn new(balancer: MaxRateBalancer) -> Self {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let store: Arc<dyn MaxRateStore> = store_over(&coordinator);
        let assignments = Arc::new(StaticAssignments::new());
        let job = BalancerJob::new(
            store.clone(),
            assignments.clone(),
            balancer,
            Arc::new(Metrics::new()),
        );
        Self {
            store,
            assignments,
            job,
        }
    }

    fn assign(&self, budget: f64, consumers: &[&str]) {
        self.assignments.assign(
            Subscription::new(billing(), budget),
            consumers.iter().map(|c| c.to_string()),
        );
    }

    fn report(&self, consumer_id: &str, utilization: f64) {
        self.store
            .write_history(
                &billing(),
                consumer_id,
                &RateHistory::from_rates([utilization], 1),
            )
            .unwrap();
    }

    fn max_rate(&self, consumer_id: &str) -> f64 {
        self.store
            .read_max_rate(&billing(), consumer_id)
            .unwrap()
            .expect("max rate written")
            .value()
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn idle_capacity_drains_to_busy_consumer_until_stable() {
    let fixture = Fixture::new(MaxRateBalancer::with_params(0.8, 1.0, 1.0));
    fixture.assign(200.0, &["busy", "idle"]);

    let first = fixture.job.run(&|| true);
    assert_eq!(first.updates, 2);
    assert_close(fixture.max_rate("busy"), 100.0);
    assert_close(fixture.max_rate("idle"), 100.0);

    fixture.report("busy", 0.95);
    fixture.report("idle", 0.05);

    let mut runs = 0;
    while fixture.job.run(&|| true).updates > 0 {
        runs += 1;
        assert!(runs < 10, "balancer did not settle");
    }

    assert_close(fixture.max_rate("idle"), 1.0);
    assert_close(fixture.max_rate("busy"), 199.0);
}

#[test]
fn small_changes_are_not_written() {
    let fixture = Fixture::new(MaxRateBalancer::with_params(0.8, 1.0, 50.0));
    fixture.assign(200.0, &["busy", "idle"]);
    fixture.job.run(&|| true);

    fixture.report("busy", 0.95);
    fixture.report("idle", 0.7);

    let summary = fixture.job.run(&|| true);
    assert_eq!(summary.updates, 0);
    assert_close(fixture.max_rate("busy"), 100.0);
    assert_close(fixture.max_rate("idle"), 100.0);
}

#[test]
fn tiny_budget_still_grants_floor_to_everyone() {
    let fixture = Fixture::new(MaxRateBalancer::with_params(0.8, 1.0, 1.0));
    let consumers = ["a", "b", "c", "d", "e"];
    fixture.assign(2.0, &consumers);
    fixture.job.run(&|| true);

    for consumer in consumers {
        assert!(fixture.max_rate(consumer) >= 1.0);
    }
}

#[test]
fn newcomer_gets_fair_share_and_departed_state_is_pruned() {
    let fixture = Fixture::new(MaxRateBalancer::with_params(0.8, 1.0, 1.0));
    fixture.assign(100.0, &["a", "b"]);
    fixture.job.run(&|| true);

    fixture.assign(100.0, &["b", "c"]);
    let summary = fixture.job.run(&|| true);
    assert_eq!(summary.pruned, 1);
    assert_close(fixture.max_rate("c"), 50.0);
    assert_close(fixture.max_rate("b"), 50.0);

    let recorded = fixture.store.list_consumers(&billing()).unwrap();
    assert!(!recorded.contains("a"));
    assert!(recorded.contains("b") && recorded.contains("c"));
}

#[test]
fn lost_leadership_abandons_run_without_writes() {
    let fixture = Fixture::new(MaxRateBalancer::with_params(0.8, 1.0, 1.0));
    fixture.assign(100.0, &["a", "b"]);

    let summary = fixture.job.run(&|| false);
    assert!(summary.abandoned);
    assert_eq!(summary.updates, 0);
    assert!(fixture.store.read_max_rate(&billing(), "a").unwrap().is_none());
}
