use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::assignment::{AssignmentListener, AssignmentSource, ListenerId};
use crate::balancer::{BalancerJob, MaxRateBalancer};
use crate::clock::{Clock, SystemClock};
use crate::config::PaceConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::rate::{LocalRateController, RateControllerFactory};
use crate::store::MaxRateStore;
use crate::subscription::{Subscription, SubscriptionName};
use crate::supervisor::{BalancerSupervisor, PeriodicSupervisor};

/// Rate controllers for the subscriptions assigned to this consumer. Created
/// when a subscription is assigned, shut down when it is taken away.
pub struct LocalConsumers {
    factory: RateControllerFactory,
    controllers: Mutex<HashMap<SubscriptionName, Arc<LocalRateController>>>,
}

impl LocalConsumers {
    pub fn new(factory: RateControllerFactory) -> Self {
        Self {
            factory,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self, name: &SubscriptionName) -> Option<Arc<LocalRateController>> {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self
            .controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, controller)| controller)
            .collect();
        for controller in drained {
            controller.shutdown();
        }
    }
}

impl AssignmentListener for LocalConsumers {
    fn consumer_id(&self) -> &str {
        self.factory.consumer_id()
    }

    fn on_subscription_assigned(&self, subscription: &Subscription) {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = controllers.get(&subscription.name) {
            existing.update_subscription_metadata(subscription.clone());
            return;
        }
        let controller = self.factory.create(subscription.clone());
        match controller.initialize() {
            Ok(()) => {
                controllers.insert(subscription.name.clone(), controller);
            }
            Err(e) => {
                error!(subscription = %subscription.name, error = %e, "failed to start rate controller");
            }
        }
    }

    fn on_assignment_removed(&self, name: &SubscriptionName) {
        let removed = self
            .controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if let Some(controller) = removed {
            controller.shutdown();
        }
    }
}

/// Everything rate control runs on one consumer process: the two periodic
/// supervisors, the controllers for assigned subscriptions, and this node's
/// seat in the balancer election.
pub struct ConsumerNode {
    consumer_id: String,
    local: Arc<LocalConsumers>,
    assignments: Arc<dyn AssignmentSource>,
    listener: ListenerId,
    rate_supervisor: PeriodicSupervisor,
    negotiation_supervisor: PeriodicSupervisor,
    balancer: BalancerSupervisor,
}

impl ConsumerNode {
    pub fn start(
        config: &PaceConfig,
        store: Arc<dyn MaxRateStore>,
        assignments: Arc<dyn AssignmentSource>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Self::start_with_clock(config, store, assignments, metrics, Arc::new(SystemClock))
    }

    #[tracing::instrument(skip_all, fields(consumer_id = %config.node.consumer_id))]
    pub fn start_with_clock(
        config: &PaceConfig,
        store: Arc<dyn MaxRateStore>,
        assignments: Arc<dyn AssignmentSource>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let consumer_id = config.node.consumer_id.clone();

        let rate_supervisor = PeriodicSupervisor::spawn(
            "pace-rate-limit-supervisor",
            config.limiter.recalculation_interval(),
        )?;
        let negotiation_supervisor = PeriodicSupervisor::spawn(
            "pace-max-rate-supervisor",
            config.negotiation.update_interval(),
        )?;

        let factory = RateControllerFactory::new(
            consumer_id.clone(),
            store.clone(),
            metrics.clone(),
            clock,
            config.limiter.clone(),
            config.negotiation.clone(),
            rate_supervisor.handle(),
            negotiation_supervisor.handle(),
        );
        let local = Arc::new(LocalConsumers::new(factory));
        let listener = assignments.add_listener(local.clone());

        let job = BalancerJob::new(
            store,
            assignments.clone(),
            MaxRateBalancer::new(&config.balancer),
            metrics,
        );
        let balancer = BalancerSupervisor::spawn(
            job,
            config.balancer.leader_path.clone(),
            consumer_id.clone(),
            config.balancer.interval(),
        )?;

        info!(controllers = local.len(), "consumer node started");

        Ok(Self {
            consumer_id,
            local,
            assignments,
            listener,
            rate_supervisor,
            negotiation_supervisor,
            balancer,
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn controller(&self, name: &SubscriptionName) -> Option<Arc<LocalRateController>> {
        self.local.controller(name)
    }

    pub fn local_consumers(&self) -> &LocalConsumers {
        &self.local
    }

    pub fn is_balancer_leader(&self) -> bool {
        self.balancer.is_leader()
    }

    /// Stop following assignments, shut every controller down, leave the
    /// election, and stop the supervisors.
    #[tracing::instrument(skip_all, fields(consumer_id = %self.consumer_id))]
    pub fn shutdown(self) -> Result<()> {
        self.assignments.remove_listener(self.listener);
        self.local.shutdown_all();
        self.balancer.shutdown()?;
        self.negotiation_supervisor.shutdown()?;
        self.rate_supervisor.shutdown()?;
        info!("consumer node stopped");
        Ok(())
    }
}
