//! Immutable reserve snapshots for one cycle path.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};
use flash_data::registry::CycleDefinition;
use flash_data::PoolStore;
use flash_data::types::PoolSnapshot;

/// Snapshot of the borrow pool followed by every swap pool, in path order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSnapshot {
    pools: Vec<PoolSnapshot>,
}

impl PathSnapshot {
    /// `pools[0]` must be the borrow pool.
    pub fn new(pools: Vec<PoolSnapshot>) -> Self {
        Self { pools }
    }

    /// Atomically captures the path's pools from the store.
    pub fn capture(store: &PoolStore, cycle: &CycleDefinition) -> Option<Self> {
        let addresses: Vec<Address> = cycle.pools().copied().collect();
        store.snapshot_many(&addresses).map(Self::new)
    }

    /// Replaces reserves of any pool present in `overrides` (hypothetical state).
    pub fn with_overrides(mut self, overrides: &HashMap<Address, (U256, U256)>) -> Self {
        for pool in &mut self.pools {
            if let Some((reserve_a, reserve_b)) = overrides.get(&pool.address) {
                pool.reserve_a = *reserve_a;
                pool.reserve_b = *reserve_b;
            }
        }
        self
    }

    pub fn borrow_pool(&self) -> Option<&PoolSnapshot> {
        self.pools.first()
    }

    pub fn swap_pools(&self) -> &[PoolSnapshot] {
        self.pools.get(1..).unwrap_or_default()
    }

    /// True when any pool on the path has an empty reserve.
    pub fn has_empty_pool(&self) -> bool {
        self.pools.iter().any(PoolSnapshot::is_empty)
    }

    pub fn pools(&self) -> &[PoolSnapshot] {
        &self.pools
    }
}
