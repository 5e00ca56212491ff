//! Selection strategies over an already-filtered eligible set. Callers pass
//! accounts sorted by id; every strategy here is deterministic given the rng
//! and the cursor, and unbiased under equal weights.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::LoadBalanceStrategy;
use crate::models::Account;

pub struct Selector {
    strategy: LoadBalanceStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// `eligible` must be non-empty and id-sorted.
    pub fn pick<'a>(&self, eligible: &'a [Account]) -> &'a Account {
        debug_assert!(!eligible.is_empty());
        debug_assert!(eligible.windows(2).all(|w| w[0].id <= w[1].id));
        match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.pick_round_robin(eligible),
            LoadBalanceStrategy::WeightedRoundRobin => pick_weighted(eligible),
            LoadBalanceStrategy::LeastUsed => pick_least_used(eligible),
            LoadBalanceStrategy::Random => {
                &eligible[rand::thread_rng().gen_range(0..eligible.len())]
            }
        }
    }

    fn pick_round_robin<'a>(&self, eligible: &'a [Account]) -> &'a Account {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        &eligible[slot % eligible.len()]
    }
}

/// Weighted random: probability = weight / Σweights. Zero total weight falls
/// back to uniform. Id order makes the cumulative walk stable so equal draws
/// break ties lexicographically.
fn pick_weighted(eligible: &[Account]) -> &Account {
    let total: u64 = eligible.iter().map(|a| a.weight as u64).sum();
    if total == 0 {
        return &eligible[rand::thread_rng().gen_range(0..eligible.len())];
    }
    let mut draw = rand::thread_rng().gen_range(0..total);
    for account in eligible {
        let weight = account.weight as u64;
        if draw < weight {
            return account;
        }
        draw -= weight;
    }
    // Unreachable for draw < total, but the compiler cannot see that.
    &eligible[eligible.len() - 1]
}

/// argmin over request_count; ties break by last_used_at ascending, then id.
fn pick_least_used(eligible: &[Account]) -> &Account {
    eligible
        .iter()
        .min_by(|a, b| {
            a.request_count
                .cmp(&b.request_count)
                .then_with(|| {
                    a.last_used_at
                        .unwrap_or(0)
                        .cmp(&b.last_used_at.unwrap_or(0))
                })
                .then_with(|| a.id.cmp(&b.id))
        })
        .expect("eligible set is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountType;
    use std::collections::HashMap;

    fn account(id: &str, weight: u32) -> Account {
        let mut acc = Account::new(
            id.into(),
            AccountType::AmazonQ,
            id.into(),
            "c".into(),
            "s".into(),
            "r".into(),
        );
        acc.weight = weight;
        acc
    }

    #[test]
    fn round_robin_cycles_in_id_order() {
        let selector = Selector::new(LoadBalanceStrategy::RoundRobin);
        let accounts = vec![account("a", 50), account("b", 50), account("c", 50)];
        let picks: Vec<&str> = (0..6).map(|_| selector.pick(&accounts).id.as_str()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn least_used_prefers_lowest_request_count_then_oldest_use() {
        let selector = Selector::new(LoadBalanceStrategy::LeastUsed);
        let mut a = account("a", 50);
        a.request_count = 5;
        let mut b = account("b", 50);
        b.request_count = 2;
        b.last_used_at = Some(200);
        let mut c = account("c", 50);
        c.request_count = 2;
        c.last_used_at = Some(100);
        let accounts = vec![a, b, c];
        assert_eq!(selector.pick(&accounts).id, "c");
    }

    #[test]
    fn equal_weights_are_unbiased_over_many_draws() {
        let selector = Selector::new(LoadBalanceStrategy::WeightedRoundRobin);
        let accounts = vec![account("a", 50), account("b", 50), account("c", 50)];
        let mut counts: HashMap<String, u64> = HashMap::new();
        let trials = 10_000u64;
        for _ in 0..trials {
            *counts.entry(selector.pick(&accounts).id.clone()).or_default() += 1;
        }
        // Expected n/3 per account; 3 sigma for a binomial with p=1/3.
        let expected = trials as f64 / 3.0;
        let sigma = (trials as f64 * (1.0 / 3.0) * (2.0 / 3.0)).sqrt();
        for count in counts.values() {
            assert!((*count as f64 - expected).abs() < 3.0 * sigma, "count={}", count);
        }
    }

    #[test]
    fn weighted_draws_track_weight_ratios() {
        let selector = Selector::new(LoadBalanceStrategy::WeightedRoundRobin);
        let accounts = vec![account("a", 10), account("b", 5), account("c", 3)];
        let mut counts: HashMap<String, f64> = HashMap::new();
        let trials = 18_000u64;
        for _ in 0..trials {
            *counts.entry(selector.pick(&accounts).id.clone()).or_default() += 1.0;
        }
        for (id, weight) in [("a", 10.0), ("b", 5.0), ("c", 3.0)] {
            let p: f64 = weight / 18.0;
            let expected = trials as f64 * p;
            let sigma = (trials as f64 * p * (1.0 - p)).sqrt();
            let actual = counts.get(id).copied().unwrap_or(0.0);
            assert!(
                (actual - expected).abs() < 3.0 * sigma,
                "{}: {} vs {}",
                id,
                actual,
                expected
            );
        }
    }

    #[test]
    fn zero_total_weight_falls_back_to_uniform() {
        let selector = Selector::new(LoadBalanceStrategy::WeightedRoundRobin);
        let accounts = vec![account("a", 0), account("b", 0)];
        // Must not panic or loop; any member is a valid pick.
        for _ in 0..100 {
            let picked = selector.pick(&accounts);
            assert!(picked.id == "a" || picked.id == "b");
        }
    }
}
