use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::config::AssignmentConfig;
use crate::subscription::{Subscription, SubscriptionName};

/// A subscription together with the consumers currently serving it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionAssignment {
    pub subscription: Subscription,
    pub consumers: BTreeSet<String>,
}

/// Receives assignment changes for one consumer.
pub trait AssignmentListener: Send + Sync {
    /// Consumer whose assignments this listener follows.
    fn consumer_id(&self) -> &str;

    /// The subscription is (still) assigned to this consumer, possibly with
    /// new metadata.
    fn on_subscription_assigned(&self, subscription: &Subscription);

    /// The subscription is no longer assigned to this consumer.
    fn on_assignment_removed(&self, name: &SubscriptionName);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Source of truth for which consumers serve which subscriptions.
pub trait AssignmentSource: Send + Sync {
    /// Snapshot of every current assignment.
    fn assignments(&self) -> Vec<SubscriptionAssignment>;

    /// Subscribe to changes. The listener is immediately told about every
    /// subscription currently assigned to its consumer.
    fn add_listener(&self, listener: Arc<dyn AssignmentListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

enum Notification {
    Assigned(Arc<dyn AssignmentListener>, Subscription),
    Removed(Arc<dyn AssignmentListener>, SubscriptionName),
}

impl Notification {
    fn deliver(self) {
        match self {
            Notification::Assigned(listener, subscription) => {
                listener.on_subscription_assigned(&subscription)
            }
            Notification::Removed(listener, name) => listener.on_assignment_removed(&name),
        }
    }
}

/// Assignments held in memory and changed explicitly, e.g. from config.
/// Listeners are notified outside the state lock, one change at a time and
/// in the order the changes were applied.
#[derive(Default)]
pub struct StaticAssignments {
    state: RwLock<BTreeMap<SubscriptionName, SubscriptionAssignment>>,
    listeners: RwLock<BTreeMap<ListenerId, Arc<dyn AssignmentListener>>>,
    // Held from a state change until its notifications are delivered.
    delivery: Mutex<()>,
    next_listener: AtomicU64,
}

impl StaticAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[AssignmentConfig]) -> Self {
        let assignments = Self::new();
        for entry in entries {
            assignments.assign(entry.subscription(), entry.consumers.iter().cloned());
        }
        assignments
    }

    /// Set the consumers of `subscription`, replacing any previous entry.
    pub fn assign(&self, subscription: Subscription, consumers: impl IntoIterator<Item = String>) {
        let consumers: BTreeSet<String> = consumers.into_iter().collect();
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.insert(
                subscription.name.clone(),
                SubscriptionAssignment {
                    subscription: subscription.clone(),
                    consumers: consumers.clone(),
                },
            )
        };
        debug!(subscription = %subscription.name, consumers = consumers.len(), "assignment updated");

        let previous_consumers = previous.map(|p| p.consumers).unwrap_or_default();
        let notifications: Vec<Notification> = self
            .listeners()
            .into_iter()
            .filter_map(|listener| {
                let id = listener.consumer_id();
                if consumers.contains(id) {
                    Some(Notification::Assigned(listener, subscription.clone()))
                } else if previous_consumers.contains(id) {
                    Some(Notification::Removed(listener, subscription.name.clone()))
                } else {
                    None
                }
            })
            .collect();
        notifications.into_iter().for_each(Notification::deliver);
    }

    /// Drop the subscription entirely.
    pub fn remove(&self, name: &SubscriptionName) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let removed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.remove(name)
        };
        let Some(removed) = removed else {
            return;
        };
        debug!(subscription = %name, "assignment removed");
        let notifications: Vec<Notification> = self
            .listeners()
            .into_iter()
            .filter(|listener| removed.consumers.contains(listener.consumer_id()))
            .map(|listener| Notification::Removed(listener, name.clone()))
            .collect();
        notifications.into_iter().for_each(Notification::deliver);
    }

    fn listeners(&self) -> Vec<Arc<dyn AssignmentListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl AssignmentSource for StaticAssignments {
    fn assignments(&self) -> Vec<SubscriptionAssignment> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn add_listener(&self, listener: Arc<dyn AssignmentListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener.clone());

        let current: Vec<Subscription> = self
            .assignments()
            .into_iter()
            .filter(|a| a.consumers.contains(listener.consumer_id()))
            .map(|a| a.subscription)
            .collect();
        for subscription in &current {
            listener.on_subscription_assigned(subscription);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}
