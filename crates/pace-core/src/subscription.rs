use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable identity of a subscription: the topic it reads from plus its
/// own name. Used as the primary coordination key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionName {
    pub topic: String,
    pub name: String,
}

impl SubscriptionName {
    pub const SEPARATOR: char = '$';

    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
        }
    }

    /// `topic$name`, unique across the cluster.
    pub fn qualified(&self) -> String {
        format!("{}{}{}", self.topic, Self::SEPARATOR, self.name)
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.topic, Self::SEPARATOR, self.name)
    }
}

/// Mutable subscription metadata. The `name` never changes for a given
/// controller; everything else may be swapped through an explicit update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: SubscriptionName,
    /// Total delivery budget (messages per second) shared by every consumer
    /// serving this subscription.
    pub rate_limit: f64,
}

impl Subscription {
    pub fn new(name: SubscriptionName, rate_limit: f64) -> Self {
        Self {
            name,
            rate_limit: rate_limit.max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_joins_topic_and_name() {
        let name = SubscriptionName::new("pl.orders", "billing");
        assert_eq!(name.qualified(), "pl.orders$billing");
        assert_eq!(name.to_string(), name.qualified());
    }

    #[test]
    fn negative_rate_limit_clamped() {
        let sub = Subscription::new(SubscriptionName::new("t", "s"), -3.0);
        assert_eq!(sub.rate_limit, 0.0);
    }
}
