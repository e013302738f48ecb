//! Path layout in the coordination store.
//!
//! ```text
//! {root}/consumers-rate/{subscription}/{consumer}/history
//! {root}/consumers-rate/{subscription}/{consumer}/max-rate
//! {root}/{leader-path}
//! ```
//!
//! `{subscription}` is the qualified name. Segments are escaped so that a
//! `/` inside a name never creates an extra level.

use crate::subscription::SubscriptionName;

const CONSUMERS_RATE: &str = "consumers-rate";
const HISTORY: &str = "history";
const MAX_RATE: &str = "max-rate";

/// Escape `%` and `/` so a name occupies exactly one path segment.
pub fn encode_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`encode_segment`].
pub fn decode_segment(segment: &str) -> String {
    let mut decoded = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(i) = rest.find('%') {
        decoded.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("%2F") {
            decoded.push('/');
            rest = &tail[3..];
        } else if tail.starts_with("%25") {
            decoded.push('%');
            rest = &tail[3..];
        } else {
            decoded.push('%');
            rest = &tail[1..];
        }
    }
    decoded.push_str(rest);
    decoded
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    root: String,
}

impl CoordinationPaths {
    /// Trailing slashes on `root` are ignored.
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn subscription_path(&self, subscription: &SubscriptionName) -> String {
        format!(
            "{}/{CONSUMERS_RATE}/{}",
            self.root,
            encode_segment(&subscription.qualified())
        )
    }

    pub fn consumer_path(&self, subscription: &SubscriptionName, consumer_id: &str) -> String {
        format!(
            "{}/{}",
            self.subscription_path(subscription),
            encode_segment(consumer_id)
        )
    }

    pub fn history_path(&self, subscription: &SubscriptionName, consumer_id: &str) -> String {
        format!("{}/{HISTORY}", self.consumer_path(subscription, consumer_id))
    }

    pub fn max_rate_path(&self, subscription: &SubscriptionName, consumer_id: &str) -> String {
        format!("{}/{MAX_RATE}", self.consumer_path(subscription, consumer_id))
    }

    pub fn leader_path(&self, name: &str) -> String {
        format!("{}/{}", self.root, name.trim_start_matches('/'))
    }
}
