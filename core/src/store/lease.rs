//! Steady-state lease assignment from reuse-interval histograms.

use crate::block::DatasetId;
use crate::store::reference::{DagInfo, ReuseHistogram};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Cache hits a dataset earns under lease `l`: every reuse no longer than
/// the lease is served from memory.
fn hits(hist: &ReuseHistogram, l: u64) -> u64 {
    hist.iter()
        .filter(|(&ri, _)| ri <= l)
        .map(|(_, &freq)| freq)
        .sum()
}

/// Cache-space cost of lease `l`: reuses within the lease occupy the slot
/// for their interval, longer reuses occupy it for the full lease.
fn cost(hist: &ReuseHistogram, l: u64) -> u128 {
    hist.iter()
        .map(|(&ri, &freq)| {
            if ri <= l {
                ri as u128 * freq as u128
            } else {
                l as u128 * freq as u128
            }
        })
        .sum()
}

/// Assigns a protection lease to each profiled dataset by greedily spending
/// a space budget where it buys the most additional hits per unit cost.
#[derive(Debug, Default)]
pub struct LeaseEngine {
    lease_map: Mutex<HashMap<DatasetId, u64>>,
    current_lease: Mutex<HashMap<DatasetId, u64>>,
}

impl LeaseEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the lease assignment from scratch, replacing the previous
    /// one. The budget is `avg_cache_size * access_number_global`: the
    /// steady-state block-accesses of residency the cache can afford.
    ///
    /// Candidate leases are the histogram's own interval keys. Each round
    /// extends the one dataset whose extension has the highest positive
    /// hits-per-unit-cost; the first candidate seen wins ties.
    pub fn recompute(&self, dag: &DagInfo, access_number_global: u64, avg_cache_size: u64) {
        let budget = avg_cache_size as u128 * access_number_global as u128;
        let mut leases: HashMap<DatasetId, u64> = dag.keys().map(|&d| (d, 0)).collect();
        let mut spent: u128 = 0;

        loop {
            let mut best: Option<(DatasetId, u64, f64, u128)> = None;
            for (&dataset, hist) in dag {
                let old = leases[&dataset];
                let old_hits = hits(hist, old);
                let old_cost = cost(hist, old);
                for &candidate in hist.keys().filter(|&&ri| ri > old) {
                    let delta_hits = hits(hist, candidate) - old_hits;
                    let delta_cost = cost(hist, candidate) - old_cost;
                    let ppuc = if delta_cost == 0 {
                        0.0
                    } else {
                        delta_hits as f64 / delta_cost as f64
                    };
                    if ppuc > 0.0 && best.map_or(true, |(_, _, b, _)| ppuc > b) {
                        best = Some((dataset, candidate, ppuc, delta_cost));
                    }
                }
            }
            let (dataset, lease, ppuc, delta_cost) = match best {
                Some(b) => b,
                None => break,
            };
            if spent + delta_cost > budget {
                break;
            }
            debug!(
                "extending lease of dataset {} to {} (ppuc {:.4})",
                dataset, lease, ppuc
            );
            leases.insert(dataset, lease);
            spent += delta_cost;
        }

        *self.lease_map.lock().unwrap() = leases;
    }

    pub fn assigned(&self, dataset: DatasetId) -> Option<u64> {
        self.lease_map.lock().unwrap().get(&dataset).copied()
    }

    pub fn current_of(&self, dataset: DatasetId) -> Option<u64> {
        self.current_lease.lock().unwrap().get(&dataset).copied()
    }

    /// Begin the remaining-lease countdown for a dataset whose block just
    /// entered memory.
    pub fn start_lease(&self, dataset: DatasetId) {
        if let Some(lease) = self.assigned(dataset) {
            self.current_lease.lock().unwrap().insert(dataset, lease);
        }
    }

    /// One cache access elapses for every leased dataset; the accessed
    /// dataset (on a hit) starts a fresh lease afterwards.
    pub fn tick(&self, accessed: Option<DatasetId>) {
        {
            let mut current = self.current_lease.lock().unwrap();
            for lease in current.values_mut() {
                *lease = lease.saturating_sub(1);
            }
        }
        if let Some(dataset) = accessed {
            self.start_lease(dataset);
        }
    }

    /// Stop tracking the remaining lease of a dataset with no cached blocks
    /// left.
    pub fn end_lease(&self, dataset: DatasetId) {
        self.current_lease.lock().unwrap().remove(&dataset);
    }

    /// Forget a dataset entirely (assignment and countdown).
    pub fn remove_dataset(&self, dataset: DatasetId) {
        self.lease_map.lock().unwrap().remove(&dataset);
        self.current_lease.lock().unwrap().remove(&dataset);
    }

    /// Snapshot of the remaining leases, for victim ordering.
    pub fn current_snapshot(&self) -> HashMap<DatasetId, u64> {
        self.current_lease.lock().unwrap().clone()
    }

    pub fn clear_current(&self) {
        self.current_lease.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dag(entries: &[(DatasetId, &[(u64, u64)])]) -> DagInfo {
        entries
            .iter()
            .map(|(d, hist)| (*d, hist.iter().copied().collect::<BTreeMap<_, _>>()))
            .collect()
    }

    #[test]
    fn test_hits_and_cost() {
        let hist: ReuseHistogram = [(2, 3), (5, 1)].into_iter().collect();
        assert_eq!(hits(&hist, 0), 0);
        assert_eq!(hits(&hist, 2), 3);
        assert_eq!(hits(&hist, 5), 4);
        // Lease 2: three reuses resident 2 each, one capped at 2.
        assert_eq!(cost(&hist, 2), 8);
        assert_eq!(cost(&hist, 5), 11);
    }

    #[test]
    fn test_recompute_assigns_full_leases_under_large_budget() {
        let engine = LeaseEngine::new();
        engine.recompute(&dag(&[(1, &[(2, 1)]), (2, &[(4, 1)])]), 100, 10);
        assert_eq!(engine.assigned(1), Some(2));
        assert_eq!(engine.assigned(2), Some(4));
    }

    #[test]
    fn test_recompute_prefers_cheap_hits_under_tight_budget() {
        let engine = LeaseEngine::new();
        // Dataset 1: one hit for cost 2. Dataset 2: one hit for cost 6.
        // Budget of 2 accesses only pays for dataset 1.
        engine.recompute(&dag(&[(1, &[(2, 1)]), (2, &[(6, 1)])]), 2, 1);
        assert_eq!(engine.assigned(1), Some(2));
        assert_eq!(engine.assigned(2), Some(0));
    }

    #[test]
    fn test_lease_never_exceeds_largest_interval() {
        let engine = LeaseEngine::new();
        engine.recompute(&dag(&[(1, &[(3, 5), (9, 2)])]), 1_000_000, 1_000);
        assert_eq!(engine.assigned(1), Some(9));
    }

    #[test]
    fn test_hits_monotone_in_budget() {
        let d = dag(&[(1, &[(2, 4), (8, 2)]), (2, &[(3, 3), (6, 1)])]);
        let mut prev_hits = 0;
        for budget in [0u64, 4, 10, 20, 50, 200] {
            let engine = LeaseEngine::new();
            engine.recompute(&d, budget, 1);
            let total: u64 = d
                .iter()
                .map(|(id, hist)| hits(hist, engine.assigned(*id).unwrap()))
                .sum();
            assert!(total >= prev_hits, "hits shrank when budget grew");
            prev_hits = total;
        }
    }

    #[test]
    fn test_recompute_replaces_previous_assignment() {
        let engine = LeaseEngine::new();
        engine.recompute(&dag(&[(1, &[(2, 1)])]), 100, 10);
        assert_eq!(engine.assigned(1), Some(2));
        engine.recompute(&dag(&[(2, &[(4, 1)])]), 100, 10);
        assert_eq!(engine.assigned(1), None);
        assert_eq!(engine.assigned(2), Some(4));
    }

    #[test]
    fn test_tick_counts_down_and_refreshes() {
        let engine = LeaseEngine::new();
        engine.recompute(&dag(&[(1, &[(3, 1)]), (2, &[(4, 1)])]), 100, 10);
        engine.start_lease(1);
        engine.start_lease(2);
        assert_eq!(engine.current_of(1), Some(3));

        engine.tick(Some(2));
        assert_eq!(engine.current_of(1), Some(2));
        assert_eq!(engine.current_of(2), Some(4));

        engine.tick(None);
        engine.tick(None);
        assert_eq!(engine.current_of(1), Some(0));
        // Saturates at zero.
        engine.tick(None);
        assert_eq!(engine.current_of(1), Some(0));
        assert_eq!(engine.current_of(2), Some(1));
    }
}
