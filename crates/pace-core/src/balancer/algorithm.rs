use std::collections::BTreeMap;

use crate::config::BalancerConfig;
use crate::rate::{MaxRate, RateHistory};

/// Tolerance for treating the allocated total as equal to the budget.
const BUDGET_EPSILON: f64 = 1e-9;

/// Stored state of one consumer as seen by the balancer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumerRateInfo {
    /// `None` for a consumer that has never been assigned a ceiling.
    pub max_rate: Option<MaxRate>,
    pub history: RateHistory,
}

impl ConsumerRateInfo {
    pub fn new(max_rate: Option<MaxRate>, history: RateHistory) -> Self {
        Self { max_rate, history }
    }
}

enum Load {
    Busy,
    Idle(f64),
    Unknown,
}

/// Redistributes a subscription's rate budget among its consumers.
///
/// 1. Consumers without a ceiling are admitted with an equal share of the
///    budget; everyone else is scaled into what remains.
/// 2. An allocation above the budget is scaled down proportionally.
/// 3. Otherwise consumers whose mean utilization is below `busy_tolerance`
///    shrink toward what they use, and the freed capacity plus any unassigned
///    budget goes to busy consumers in proportion to their current ceilings.
///    With no busy consumers nothing changes.
/// 4. When every consumer with a history is busy, their ceilings move to an
///    equal split of what they hold plus any unassigned budget.
///
/// Every written value is at least `min_max_rate`. A change smaller than
/// `min_allowed_change_percent` of the current ceiling is not written.
#[derive(Debug, Clone)]
pub struct MaxRateBalancer {
    busy_tolerance: f64,
    min_max_rate: f64,
    min_allowed_change_percent: f64,
}

impl MaxRateBalancer {
    pub fn new(config: &BalancerConfig) -> Self {
        Self::with_params(
            config.busy_tolerance,
            config.min_max_rate,
            config.min_allowed_change_percent,
        )
    }

    pub fn with_params(
        busy_tolerance: f64,
        min_max_rate: f64,
        min_allowed_change_percent: f64,
    ) -> Self {
        Self {
            busy_tolerance,
            min_max_rate: min_max_rate.max(0.0),
            min_allowed_change_percent: min_allowed_change_percent.max(0.0),
        }
    }

    /// New ceilings for the consumers whose ceiling should change. Consumers
    /// absent from the result keep their current value.
    pub fn balance(
        &self,
        budget: f64,
        consumers: &BTreeMap<String, ConsumerRateInfo>,
    ) -> BTreeMap<String, MaxRate> {
        if consumers.is_empty() {
            return BTreeMap::new();
        }
        let budget = if budget.is_nan() { 0.0 } else { budget.max(0.0) };

        if consumers.values().any(|c| c.max_rate.is_none()) {
            return self.admit_newcomers(budget, consumers);
        }

        let current: BTreeMap<&String, f64> = consumers
            .iter()
            .map(|(id, info)| (id, info.max_rate.map_or(0.0, MaxRate::value)))
            .collect();
        let total: f64 = current.values().sum();

        if total > budget + BUDGET_EPSILON {
            let scale = if total > 0.0 { budget / total } else { 0.0 };
            return current
                .iter()
                .filter_map(|(id, rate)| self.proposal(id, *rate, rate * scale))
                .collect();
        }

        self.shift_from_idle_to_busy(budget - total, consumers, &current)
    }

    fn admit_newcomers(
        &self,
        budget: f64,
        consumers: &BTreeMap<String, ConsumerRateInfo>,
    ) -> BTreeMap<String, MaxRate> {
        let newcomers = consumers.values().filter(|c| c.max_rate.is_none()).count();
        let fair_share = budget / consumers.len() as f64;
        let existing_total: f64 = consumers
            .values()
            .filter_map(|c| c.max_rate.map(MaxRate::value))
            .sum();
        let remaining = (budget - fair_share * newcomers as f64).max(0.0);
        let scale = if existing_total > 0.0 {
            (remaining / existing_total).min(1.0)
        } else {
            0.0
        };

        consumers
            .iter()
            .filter_map(|(id, info)| match info.max_rate {
                None => Some((id.clone(), MaxRate::new(fair_share.max(self.min_max_rate)))),
                Some(current) => {
                    let current = current.value();
                    self.proposal(id, current, current * scale)
                }
            })
            .collect()
    }

    fn shift_from_idle_to_busy(
        &self,
        unassigned: f64,
        consumers: &BTreeMap<String, ConsumerRateInfo>,
        current: &BTreeMap<&String, f64>,
    ) -> BTreeMap<String, MaxRate> {
        let loads: BTreeMap<&String, Load> = consumers
            .iter()
            .map(|(id, info)| (id, self.classify(&info.history)))
            .collect();

        let busy: Vec<&String> = loads
            .iter()
            .filter(|(_, load)| matches!(load, Load::Busy))
            .map(|(id, _)| *id)
            .collect();
        if busy.is_empty() {
            return BTreeMap::new();
        }
        if !loads.values().any(|load| matches!(load, Load::Idle(_))) {
            return self.equalize_busy(&busy, unassigned, current);
        }

        let mut updates = BTreeMap::new();
        let mut freed = unassigned.max(0.0);

        for (id, load) in &loads {
            if let Load::Idle(utilization) = load {
                let rate = current[id];
                let target = rate * utilization / self.busy_tolerance;
                if let Some((id, new_rate)) = self.proposal(id, rate, target) {
                    freed += rate - new_rate.value();
                    updates.insert(id, new_rate);
                }
            }
        }

        if freed <= BUDGET_EPSILON {
            return updates;
        }

        let busy_total: f64 = busy.iter().map(|id| current[id]).sum();
        for id in busy {
            let rate = current[id];
            let share = if busy_total > 0.0 {
                rate / busy_total
            } else {
                1.0 / loads.values().filter(|l| matches!(l, Load::Busy)).count() as f64
            };
            if let Some((id, new_rate)) = self.proposal(id, rate, rate + freed * share) {
                updates.insert(id, new_rate);
            }
        }
        updates
    }

    /// Every classified consumer is busy: split their combined ceilings plus
    /// any unassigned budget equally, so a consumer shrunk while it was idle
    /// wins its share back once demand returns.
    fn equalize_busy(
        &self,
        busy: &[&String],
        unassigned: f64,
        current: &BTreeMap<&String, f64>,
    ) -> BTreeMap<String, MaxRate> {
        let pool: f64 = busy.iter().map(|id| current[id]).sum::<f64>() + unassigned.max(0.0);
        let share = pool / busy.len() as f64;
        busy.iter()
            .filter_map(|id| self.proposal(id, current[id], share))
            .collect()
    }

    fn classify(&self, history: &RateHistory) -> Load {
        match history.mean() {
            None => Load::Unknown,
            Some(mean) if mean >= self.busy_tolerance => Load::Busy,
            Some(mean) => Load::Idle(mean),
        }
    }

    /// Floor `target` at the minimum and keep it only if it moves the
    /// ceiling by at least the configured percentage.
    fn proposal(&self, id: &str, current: f64, target: f64) -> Option<(String, MaxRate)> {
        let target = target.max(self.min_max_rate);
        let changed = if current <= 0.0 {
            target != current
        } else {
            (target - current).abs() / current * 100.0 >= self.min_allowed_change_percent
        };
        changed.then(|| (id.to_string(), MaxRate::new(target)))
    }
}
