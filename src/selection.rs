//! Provider Selection Engine: scores ESPs from recent delivery stats,
//! normalizes to an integer weight vector, and draws a provider for a
//! recipient (SPEC_FULL.md §4.B).

use std::collections::BTreeMap;

use rand::Rng;

use crate::credentials::{Provider, TenantCredentials};
use crate::error::RelayError;

/// Per-provider delivery totals over a stats window, as returned by
/// `EventStore::provider_stats` (see `crate::store`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    pub total: u64,
    pub delivered: u64,
    pub bounce: u64,
    pub open: u64,
    pub deferred: u64,
    pub spam: u64,
}

impl ProviderStats {
    fn score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let total = self.total as f64;
        let open_rate = self.open as f64 / total;
        let success_rate = self.delivered as f64 / total;
        let bounce_rate = self.bounce as f64 / total;
        let spam_rate = self.spam as f64 / total;
        (0.5 * open_rate + 0.2 * success_rate - 0.3 * bounce_rate - 0.2 * spam_rate).max(0.0)
    }
}

const WEIGHT_TOTAL: u32 = 1000;

/// Compute a normalized weight map for a tenant's providers.
///
/// Invariant (§8.1): the returned weights sum to `WEIGHT_TOTAL`, or to 0 iff
/// no provider has a valid credential. A provider with an invalid
/// credential always receives weight 0, regardless of its stats.
pub fn compute_weights(
    credentials: &TenantCredentials,
    stats: &BTreeMap<Provider, ProviderStats>,
) -> BTreeMap<Provider, u32> {
    let valid: Vec<Provider> = credentials.valid_providers();
    if valid.is_empty() {
        return Provider::ALL.iter().map(|p| (*p, 0)).collect();
    }

    let scores: BTreeMap<Provider, f64> = valid
        .iter()
        .map(|p| (*p, stats.get(p).copied().unwrap_or_default().score()))
        .collect();
    let total_score: f64 = scores.values().sum();

    let mut weights: BTreeMap<Provider, u32> = Provider::ALL.iter().map(|p| (*p, 0)).collect();

    if total_score > 0.0 {
        let mut assigned = 0u32;
        let mut remainders: Vec<(Provider, f64)> = Vec::new();
        for (p, score) in &scores {
            let exact = WEIGHT_TOTAL as f64 * score / total_score;
            let floor = exact.floor();
            weights.insert(*p, floor as u32);
            assigned += floor as u32;
            remainders.push((*p, exact - floor));
        }
        // Distribute the rounding remainder (dropped by per-provider floor)
        // to the largest fractional remainders so the total still sums to
        // WEIGHT_TOTAL exactly.
        remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut leftover = WEIGHT_TOTAL.saturating_sub(assigned);
        for (p, _) in remainders {
            if leftover == 0 {
                break;
            }
            *weights.get_mut(&p).unwrap() += 1;
            leftover -= 1;
        }
    } else {
        let share = WEIGHT_TOTAL / valid.len() as u32;
        let mut remainder = WEIGHT_TOTAL - share * valid.len() as u32;
        for p in &valid {
            let mut w = share;
            if remainder > 0 {
                w += 1;
                remainder -= 1;
            }
            weights.insert(*p, w);
        }
    }

    weights
}

/// Draw a provider from a weight map using the given RNG, walking entries
/// in the map's deterministic iteration order (§4.B). Returns
/// `RelayError::InvalidCredential` if the total weight is 0.
pub fn select<R: Rng + ?Sized>(
    weights: &BTreeMap<Provider, u32>,
    tenant: i64,
    rng: &mut R,
) -> Result<Provider, RelayError> {
    let total: u32 = weights.values().sum();
    if total == 0 {
        return Err(RelayError::InvalidCredential { tenant });
    }

    let r = rng.gen_range(0..total);
    let mut running = 0u32;
    for (provider, weight) in weights {
        running += weight;
        if running > r {
            return Ok(*provider);
        }
    }
    unreachable!("cumulative weight sum must exceed every draw below total")
}

/// Blend a batch's frozen initial weights with weights recomputed from the
/// most recent wave, then re-normalize to `WEIGHT_TOTAL` (§4.B, §8.5).
pub fn adjust_weights(
    initial: &BTreeMap<Provider, u32>,
    recent: &BTreeMap<Provider, u32>,
) -> BTreeMap<Provider, u32> {
    let blended: BTreeMap<Provider, f64> = Provider::ALL
        .iter()
        .map(|p| {
            let i = *initial.get(p).unwrap_or(&0) as f64;
            let r = *recent.get(p).unwrap_or(&0) as f64;
            (*p, 0.7 * i + 0.3 * r)
        })
        .collect();

    let total: f64 = blended.values().sum();
    if total <= 0.0 {
        return Provider::ALL.iter().map(|p| (*p, 0)).collect();
    }

    let mut weights: BTreeMap<Provider, u32> = BTreeMap::new();
    let mut assigned = 0u32;
    let mut remainders: Vec<(Provider, f64)> = Vec::new();
    for (p, v) in &blended {
        let exact = WEIGHT_TOTAL as f64 * v / total;
        let floor = exact.floor();
        weights.insert(*p, floor as u32);
        assigned += floor as u32;
        remainders.push((*p, exact - floor));
    }
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut leftover = WEIGHT_TOTAL.saturating_sub(assigned);
    for (p, _) in remainders {
        if leftover == 0 {
            break;
        }
        *weights.get_mut(&p).unwrap() += 1;
        leftover -= 1;
    }
    weights
}
