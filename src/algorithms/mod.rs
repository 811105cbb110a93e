//! Limit distribution algorithms
//!
//! Pure functions used by the leader to split a total limit between members.
//! They hold no locks and know nothing about members beyond the numbers
//! passed in.

use std::collections::HashMap;
use std::hash::Hash;

const SEARCH_ITERATIONS: usize = 128;

/// Largest `x` in `[lo, hi]` for which `predicate(x)` holds.
///
/// `predicate` must be monotone: true up to some point, false after it. If it
/// does not even hold at `lo`, `lo` is returned.
pub fn floating_point_inverse_lower_bound<F>(mut lo: f64, mut hi: f64, predicate: F) -> f64
where
    F: Fn(f64) -> bool,
{
    if predicate(hi) {
        return hi;
    }

    for _ in 0..SEARCH_ITERATIONS {
        let mid = lo + (hi - lo) / 2.0;
        if mid <= lo || mid >= hi {
            break;
        }
        if predicate(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Equal split of `total_limit` between `member_count` members, never below one unit.
pub fn uniform_limit(total_limit: f64, member_count: usize) -> f64 {
    (total_limit / member_count.max(1) as f64).max(1.0)
}

/// Per-member cap `D` such that `sum(min(usage, D)) <= total_limit`, as large as possible.
pub fn water_filling_cap<'a, I>(total_limit: f64, usage_rates: I) -> f64
where
    I: IntoIterator<Item = &'a f64> + Clone,
{
    floating_point_inverse_lower_bound(0.0, total_limit, |cap| {
        let total: f64 = usage_rates.clone().into_iter().map(|rate| rate.min(cap)).sum();
        total <= total_limit
    })
}

/// Outcome of the adaptive split for a single throttler.
#[derive(Debug, Clone)]
pub struct AdaptiveAllocation<K> {
    pub default_limit: f64,
    pub extra_limit: f64,
    pub limits: HashMap<K, f64>,
}

/// Max-min fair split of `total_limit` by reported usage.
///
/// Each member gets `min(usage, D) + extra`, where `D` is the water-filling
/// cap and `extra` spreads `extra_limit_ratio * total_limit` plus any unused
/// part of the total evenly across `member_count` members.
pub fn adaptive_limits<K>(
    total_limit: f64,
    usage_rates: &HashMap<K, f64>,
    member_count: usize,
    extra_limit_ratio: f64,
) -> AdaptiveAllocation<K>
where
    K: Clone + Eq + Hash,
{
    let total_usage: f64 = usage_rates.values().sum();
    let default_limit = water_filling_cap(total_limit, usage_rates.values());
    let extra_limit = (extra_limit_ratio * total_limit + (total_limit - total_usage).max(0.0))
        / member_count.max(1) as f64;

    let limits = usage_rates
        .iter()
        .map(|(member, rate)| (member.clone(), rate.min(default_limit) + extra_limit))
        .collect();

    AdaptiveAllocation {
        default_limit,
        extra_limit,
        limits,
    }
}
