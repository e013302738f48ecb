use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::rate::{MaxRate, RateHistory};
use crate::store::election::LeaderLatch;
use crate::store::paths::{decode_segment, CoordinationPaths};
use crate::store::traits::{CoordinationStore, MaxRateStore, Versioned};
use crate::subscription::SubscriptionName;

/// `MaxRateStore` over any `CoordinationStore`. Values are JSON; history
/// updates use compare-and-set so concurrent writers never lose updates.
pub struct CoordinatedMaxRateStore {
    coordinator: Arc<dyn CoordinationStore>,
    paths: CoordinationPaths,
    cas_retries: u32,
}

impl CoordinatedMaxRateStore {
    pub fn new(coordinator: Arc<dyn CoordinationStore>, root: &str, cas_retries: u32) -> Self {
        Self {
            coordinator,
            paths: CoordinationPaths::new(root),
            cas_retries,
        }
    }

    pub fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    /// Read a node, treating one the backend cannot decode as absent.
    fn get_node(&self, path: &str) -> StoreResult<Option<Versioned>> {
        match self.coordinator.get(path) {
            Err(StoreError::Serialization(reason)) => {
                warn!(path, %reason, "discarding corrupt node");
                Ok(None)
            }
            result => result,
        }
    }

    /// Decode a node, treating corrupt data as absent.
    fn decode<T: DeserializeOwned>(path: &str, node: &Versioned) -> Option<T> {
        match serde_json::from_slice(&node.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path, error = %e, "discarding undecodable node");
                None
            }
        }
    }

    fn decode_history(path: &str, node: &Versioned) -> Option<RateHistory> {
        Self::decode::<RateHistory>(path, node).filter(|history| {
            let valid = history.is_valid();
            if !valid {
                warn!(path, "discarding history with out-of-range ratios");
            }
            valid
        })
    }
}

impl MaxRateStore for CoordinatedMaxRateStore {
    fn read_or_create_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<RateHistory> {
        let path = self.paths.history_path(subscription, consumer_id);
        if let Some(node) = self.get_node(&path)? {
            return Ok(Self::decode_history(&path, &node).unwrap_or_default());
        }
        let empty = RateHistory::empty();
        match self
            .coordinator
            .compare_and_set(&path, &serde_json::to_vec(&empty)?, None)
        {
            Ok(_) => {
                debug!(%path, "created empty history");
                Ok(empty)
            }
            // Created concurrently by someone else; theirs wins.
            Err(StoreError::Conflict { .. }) => Ok(self
                .get_node(&path)?
                .and_then(|node| Self::decode_history(&path, &node))
                .unwrap_or_default()),
            Err(e) => Err(e),
        }
    }

    fn read_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<RateHistory>> {
        let path = self.paths.history_path(subscription, consumer_id);
        Ok(self
            .get_node(&path)?
            .and_then(|node| Self::decode_history(&path, &node)))
    }

    fn write_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        history: &RateHistory,
    ) -> StoreResult<()> {
        let path = self.paths.history_path(subscription, consumer_id);
        self.coordinator.set(&path, &serde_json::to_vec(history)?)?;
        Ok(())
    }

    fn update_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        update: &dyn Fn(&RateHistory) -> RateHistory,
    ) -> StoreResult<RateHistory> {
        let path = self.paths.history_path(subscription, consumer_id);
        let mut attempt = 0;
        loop {
            let (current, expected) = match self.get_node(&path)? {
                Some(node) => (
                    Self::decode_history(&path, &node).unwrap_or_default(),
                    Some(node.version),
                ),
                None => (RateHistory::empty(), None),
            };
            let next = update(&current);
            match self
                .coordinator
                .compare_and_set(&path, &serde_json::to_vec(&next)?, expected)
            {
                Ok(_) => return Ok(next),
                Err(conflict @ StoreError::Conflict { .. }) => {
                    if attempt >= self.cas_retries {
                        return Err(conflict);
                    }
                    attempt += 1;
                    debug!(%path, attempt, "history changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<MaxRate>> {
        let path = self.paths.max_rate_path(subscription, consumer_id);
        Ok(self
            .get_node(&path)?
            .and_then(|node| Self::decode::<MaxRate>(&path, &node))
            .filter(|rate| {
                let valid = rate.is_valid();
                if !valid {
                    warn!(%path, "discarding invalid max rate");
                }
                valid
            }))
    }

    fn write_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        max_rate: MaxRate,
    ) -> StoreResult<()> {
        let path = self.paths.max_rate_path(subscription, consumer_id);
        self.coordinator.set(&path, &serde_json::to_vec(&max_rate)?)?;
        Ok(())
    }

    fn list_consumers(&self, subscription: &SubscriptionName) -> StoreResult<BTreeSet<String>> {
        let path = self.paths.subscription_path(subscription);
        Ok(self
            .coordinator
            .list_children(&path)?
            .iter()
            .map(|child| decode_segment(child))
            .collect())
    }

    fn remove_consumer(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<()> {
        let path = self.paths.consumer_path(subscription, consumer_id);
        self.coordinator.delete_recursive(&path)
    }

    fn elect_leader(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch> {
        self.coordinator
            .join_election(&self.paths.leader_path(path), candidate)
    }
}
