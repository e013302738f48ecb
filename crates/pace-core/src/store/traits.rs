use std::collections::BTreeSet;

use crate::error::StoreResult;
use crate::rate::{MaxRate, RateHistory};
use crate::store::election::LeaderLatch;
use crate::subscription::SubscriptionName;

/// A stored node value with its version. Versions start at 1 on create and
/// grow by one on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Hierarchical, versioned key-value store with leader election. Paths are
/// `/`-separated. Implementations must be thread-safe.
pub trait CoordinationStore: Send + Sync {
    /// Read a node.
    fn get(&self, path: &str) -> StoreResult<Option<Versioned>>;

    /// Write a node only if its version matches `expected_version`. `None`
    /// means the node must not exist yet. Returns the new version, or
    /// `StoreError::Conflict` on mismatch.
    fn compare_and_set(
        &self,
        path: &str,
        value: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;

    /// Unconditionally write a node, creating it if needed. Returns the new version.
    fn set(&self, path: &str, value: &[u8]) -> StoreResult<u64>;

    /// Names of the direct children of `parent`, sorted.
    fn list_children(&self, parent: &str) -> StoreResult<BTreeSet<String>>;

    /// Delete a node and everything beneath it. Deleting a missing path is not an error.
    fn delete_recursive(&self, path: &str) -> StoreResult<()>;

    /// Enter the election at `path` as `candidate`. The latch reports
    /// leadership changes until it is dropped.
    fn join_election(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch>;
}

/// Shared persistence for rate histories and max rates, plus the leadership
/// primitive used by the balancer. Every operation may fail transiently;
/// callers decide whether to fall back or skip.
pub trait MaxRateStore: Send + Sync {
    /// Read the history, creating an empty one if none exists.
    fn read_or_create_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<RateHistory>;

    /// Read the history. Missing or undecodable data is `None`.
    fn read_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<RateHistory>>;

    fn write_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        history: &RateHistory,
    ) -> StoreResult<()>;

    /// Read-modify-write the history and return what was written.
    ///
    /// The default reads then writes; backends with versioning override this
    /// so concurrent updates are never lost.
    fn update_history(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        update: &dyn Fn(&RateHistory) -> RateHistory,
    ) -> StoreResult<RateHistory> {
        let current = self.read_or_create_history(subscription, consumer_id)?;
        let next = update(&current);
        self.write_history(subscription, consumer_id, &next)?;
        Ok(next)
    }

    /// Read the max rate. Missing or invalid data is `None`.
    fn read_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
    ) -> StoreResult<Option<MaxRate>>;

    fn write_max_rate(
        &self,
        subscription: &SubscriptionName,
        consumer_id: &str,
        max_rate: MaxRate,
    ) -> StoreResult<()>;

    /// Consumers that have any state recorded under `subscription`.
    fn list_consumers(&self, subscription: &SubscriptionName) -> StoreResult<BTreeSet<String>>;

    /// Delete history and max rate for a consumer.
    fn remove_consumer(&self, subscription: &SubscriptionName, consumer_id: &str)
        -> StoreResult<()>;

    /// Join the leader election named `path` (relative to the store root).
    fn elect_leader(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch>;
}
