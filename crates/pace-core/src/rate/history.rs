use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Bounded window of recent utilization ratios for one (subscription, consumer)
/// pair, oldest first. Each ratio is the fraction of the ceiling actually used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateHistory {
    rates: VecDeque<f64>,
}

impl RateHistory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a history from raw ratios, keeping at most `limit` newest entries.
    pub fn from_rates(rates: impl IntoIterator<Item = f64>, limit: usize) -> Self {
        let mut history = Self::empty();
        for rate in rates {
            history.push(rate, limit);
        }
        history
    }

    /// Append a ratio, evicting the oldest entries beyond `limit`. Ratios are
    /// clamped to [0, 1]; NaN is recorded as 0.
    pub fn push(&mut self, rate: f64, limit: usize) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self.rates.push_back(rate);
        while self.rates.len() > limit {
            self.rates.pop_front();
        }
    }

    /// Copy of this history with `rate` appended.
    pub fn updated(&self, rate: f64, limit: usize) -> Self {
        let mut next = self.clone();
        next.push(rate, limit);
        next
    }

    pub fn rates(&self) -> impl Iterator<Item = f64> + '_ {
        self.rates.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Mean utilization, or `None` for an empty history.
    pub fn mean(&self) -> Option<f64> {
        if self.rates.is_empty() {
            return None;
        }
        Some(self.rates.iter().sum::<f64>() / self.rates.len() as f64)
    }

    /// Whether every entry is a ratio in [0, 1]. Decoded data failing this
    /// check is treated as absent.
    pub fn is_valid(&self) -> bool {
        self.rates
            .iter()
            .all(|r| r.is_finite() && (0.0..=1.0).contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_evicts_oldest_first() {
        let mut history = RateHistory::empty();
        history.push(0.1, 3);
        history.push(0.2, 3);
        history.push(0.3, 3);
        history.push(0.4, 3);
        assert_eq!(history.rates().collect::<Vec<_>>(), vec![0.2, 0.3, 0.4]);
    }

    #[test]
    fn updated_leaves_original_untouched() {
        let history = RateHistory::from_rates([0.5], 2);
        let next = history.updated(0.7, 2);
        assert_eq!(history.len(), 1);
        assert_eq!(next.rates().collect::<Vec<_>>(), vec![0.5, 0.7]);
    }

    #[test]
    fn ratios_clamped_into_unit_interval() {
        let history = RateHistory::from_rates([-0.5, 1.7, f64::NAN], 5);
        assert_eq!(history.rates().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0]);
        assert!(history.is_valid());
    }

    #[test]
    fn mean_of_empty_history_is_none() {
        assert_eq!(RateHistory::empty().mean(), None);
        let history = RateHistory::from_rates([0.2, 0.4], 5);
        assert!((history.mean().unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn shrinking_limit_trims_on_next_push() {
        let mut history = RateHistory::from_rates([0.1, 0.2, 0.3, 0.4], 4);
        history.push(0.5, 2);
        assert_eq!(history.rates().collect::<Vec<_>>(), vec![0.4, 0.5]);
    }

    #[test]
    fn decoded_out_of_range_values_are_invalid() {
        let history: RateHistory = serde_json::from_str(r#"{"rates":[0.5,3.0]}"#).unwrap();
        assert!(!history.is_valid());
    }

    proptest! {
        #[test]
        fn never_exceeds_limit_and_keeps_newest_in_order(
            rates in proptest::collection::vec(0.0f64..=1.0, 0..64),
            limit in 1usize..16,
        ) {
            let mut history = RateHistory::empty();
            for rate in &rates {
                history.push(*rate, limit);
                prop_assert!(history.len() <= limit);
            }
            let expected: Vec<f64> = rates
                .iter()
                .copied()
                .skip(rates.len().saturating_sub(limit))
                .collect();
            prop_assert_eq!(history.rates().collect::<Vec<_>>(), expected);
        }
    }
}
