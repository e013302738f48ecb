use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::assignment::{AssignmentSource, SubscriptionAssignment};
use crate::balancer::algorithm::{ConsumerRateInfo, MaxRateBalancer};
use crate::metrics::Metrics;
use crate::store::MaxRateStore;

/// Outcome of one balancing pass, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub subscriptions: usize,
    pub skipped: usize,
    pub updates: usize,
    pub write_failures: usize,
    pub pruned: usize,
    /// Leadership was lost mid-run and the remaining writes were abandoned.
    pub abandoned: bool,
}

/// One balancing pass over every assigned subscription. Only run by the
/// elected leader.
pub struct BalancerJob {
    store: Arc<dyn MaxRateStore>,
    assignments: Arc<dyn AssignmentSource>,
    balancer: MaxRateBalancer,
    metrics: Arc<Metrics>,
}

impl BalancerJob {
    pub fn new(
        store: Arc<dyn MaxRateStore>,
        assignments: Arc<dyn AssignmentSource>,
        balancer: MaxRateBalancer,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            assignments,
            balancer,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn MaxRateStore> {
        &self.store
    }

    /// Balance every subscription. `still_leader` is consulted before each
    /// write; once it returns false the run stops without writing more.
    #[tracing::instrument(skip_all)]
    pub fn run(&self, still_leader: &dyn Fn() -> bool) -> RunSummary {
        self.metrics.record_balancer_run();
        let mut summary = RunSummary::default();

        for assignment in self.assignments.assignments() {
            if !still_leader() {
                summary.abandoned = true;
                break;
            }
            summary.subscriptions += 1;
            self.balance_subscription(&assignment, still_leader, &mut summary);
            if summary.abandoned {
                break;
            }
        }

        if summary.abandoned {
            info!(?summary, "leadership lost, balancing run abandoned");
        } else {
            debug!(?summary, "balancing run complete");
        }
        summary
    }

    fn balance_subscription(
        &self,
        assignment: &SubscriptionAssignment,
        still_leader: &dyn Fn() -> bool,
        summary: &mut RunSummary,
    ) {
        let name = &assignment.subscription.name;

        match self.store.list_consumers(name) {
            Ok(recorded) => {
                for stale in recorded.difference(&assignment.consumers) {
                    match self.store.remove_consumer(name, stale) {
                        Ok(()) => {
                            summary.pruned += 1;
                            self.metrics.record_pruned_consumer(name);
                            info!(subscription = %name, consumer_id = %stale, "removed state of unassigned consumer");
                        }
                        Err(e) => {
                            warn!(subscription = %name, consumer_id = %stale, error = %e, "failed to remove stale consumer");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(subscription = %name, error = %e, "failed to list recorded consumers");
            }
        }

        let mut consumers = BTreeMap::new();
        for consumer_id in &assignment.consumers {
            let history = self.store.read_history(name, consumer_id);
            let max_rate = self.store.read_max_rate(name, consumer_id);
            match (history, max_rate) {
                (Ok(history), Ok(max_rate)) => {
                    consumers.insert(
                        consumer_id.clone(),
                        ConsumerRateInfo::new(max_rate, history.unwrap_or_default()),
                    );
                }
                (Err(e), _) | (_, Err(e)) => {
                    summary.skipped += 1;
                    self.metrics.record_balancer_read_failure(name);
                    warn!(subscription = %name, consumer_id = %consumer_id, error = %e, "failed to read consumer state, skipping subscription");
                    return;
                }
            }
        }

        let updates = self
            .balancer
            .balance(assignment.subscription.rate_limit, &consumers);

        for (consumer_id, max_rate) in updates {
            if !still_leader() {
                summary.abandoned = true;
                return;
            }
            match self.store.write_max_rate(name, &consumer_id, max_rate) {
                Ok(()) => {
                    summary.updates += 1;
                    self.metrics.record_balancer_update(name);
                    debug!(subscription = %name, %consumer_id, max_rate = max_rate.value(), "max rate updated");
                }
                Err(e) => {
                    summary.write_failures += 1;
                    self.metrics.record_balancer_write_failure(name);
                    warn!(subscription = %name, %consumer_id, error = %e, "failed to write max rate");
                }
            }
        }
    }
}
