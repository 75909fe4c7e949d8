//! Per-cycle simulation counters and cached gas estimates.

use dashmap::DashMap;
use eyre::{Context, Result};
use flash_data::store::{CycleStats, Store};
use flash_data::CycleId;
use flash_sim::CycleBook;

/// In-memory counters, written through to the [`Store`] by the bundler.
#[derive(Debug, Default)]
pub struct CycleTracker {
    stats: DashMap<CycleId, CycleStats>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores persisted counters for every cycle in `book`.
    ///
    /// # Errors
    /// Returns error if the stats table cannot be read.
    pub fn load(store: &Store, book: &CycleBook) -> Result<Self> {
        let tracker = Self::new();
        for (id, cycle) in book.definitions().iter().enumerate() {
            let stats = store
                .cycle_stats(&cycle.id)
                .wrap_err_with(|| format!("failed to read stats for cycle {}", cycle.id))?;
            if let Some(stats) = stats {
                tracker.stats.insert(id, stats);
            }
        }
        Ok(tracker)
    }

    pub fn stats(&self, id: CycleId) -> CycleStats {
        self.stats.get(&id).map(|stats| *stats).unwrap_or_default()
    }

    /// Counts one relay simulation and returns the updated counters.
    pub fn record_simulation(&self, id: CycleId, failed: bool) -> CycleStats {
        let mut stats = self.stats.entry(id).or_default();
        stats.simulations += 1;
        if failed {
            stats.failures += 1;
        }
        *stats
    }

    pub fn set_gas(&self, id: CycleId, gas: u64) -> CycleStats {
        let mut stats = self.stats.entry(id).or_default();
        stats.gas_estimate = Some(gas);
        *stats
    }

    pub fn gas_estimate(&self, id: CycleId) -> Option<u64> {
        self.stats.get(&id).and_then(|stats| stats.gas_estimate)
    }

    /// Zeroes the counters, keeping the cached gas estimate.
    pub fn reset(&self, id: CycleId) -> CycleStats {
        let mut stats = self.stats.entry(id).or_default();
        stats.simulations = 0;
        stats.failures = 0;
        *stats
    }

    pub fn remove(&self, id: CycleId) -> Option<CycleStats> {
        self.stats.remove(&id).map(|(_, stats)| stats)
    }

    /// Cycles with at least `min_attempts` simulations whose failure ratio
    /// exceeds `fail_pct` percent.
    pub fn candidates(&self, min_attempts: u32, fail_pct: u32) -> Vec<CycleId> {
        let mut ids: Vec<CycleId> = self
            .stats
            .iter()
            .filter(|entry| {
                let stats = entry.value();
                stats.simulations > 0
                    && stats.simulations >= min_attempts
                    && u64::from(stats.failures) * 100
                        > u64::from(fail_pct) * u64::from(stats.simulations)
            })
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }
}
