//! Authoritative in-memory mirror of pool reserves.
//!
//! [`PoolStore`] is the only writer of reserves. Writes are ordered by
//! `(block, sequence)` provenance and fenced by a per-feed generation counter
//! so that late frames from a dropped websocket connection cannot overwrite
//! newer state. Every successful write marks the cycles that route through
//! the pool as dirty; the optimizer drains that set with [`PoolStore::take_dirty`].
//!
//! Readers only ever receive cloned snapshots taken under the read lock, so
//! a batch applied through [`PoolStore::apply_batch`] is observed either
//! entirely or not at all.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy::primitives::{Address, U256};

use crate::registry::CycleDefinition;
use crate::types::{CycleId, FeedKind, PoolSnapshot, ReserveUpdate};

#[derive(Debug, Default)]
struct Inner {
    pools: HashMap<Address, PoolSnapshot>,
    cycles_by_pool: HashMap<Address, Vec<CycleId>>,
    dirty: BTreeSet<CycleId>,
    cycle_count: usize,
}

impl Inner {
    fn apply(&mut self, update: &ReserveUpdate) -> bool {
        let Some(pool) = self.pools.get_mut(&update.pool) else {
            return false;
        };

        if update.generation < pool.source_generation {
            tracing::trace!(
                pool = %update.pool,
                generation = update.generation,
                accepted = pool.source_generation,
                "rejecting update from superseded connection"
            );
            return false;
        }

        let incoming = (update.block, update.sequence);
        let current = (pool.last_update_block, pool.last_update_sequence);
        if incoming <= current {
            tracing::trace!(
                pool = %update.pool,
                block = update.block,
                sequence = update.sequence,
                "rejecting stale reserve update"
            );
            return false;
        }

        pool.reserve_a = update.reserve_a;
        pool.reserve_b = update.reserve_b;
        pool.last_update_block = update.block;
        pool.last_update_sequence = update.sequence;
        pool.source_generation = update.generation;

        if let Some(cycles) = self.cycles_by_pool.get(&update.pool) {
            self.dirty.extend(cycles.iter().copied());
        }
        true
    }
}

/// Thread-safe pool state store.
#[derive(Debug)]
pub struct PoolStore {
    inner: RwLock<Inner>,
    generations: [AtomicU64; 3],
}

impl PoolStore {
    /// Builds the store from registry pools and the cycles routed through them.
    ///
    /// Every cycle starts dirty so it is optimized once on first construction.
    pub fn new(pools: Vec<PoolSnapshot>, cycles: &[CycleDefinition]) -> Self {
        let mut inner = Inner {
            pools: pools.into_iter().map(|pool| (pool.address, pool)).collect(),
            cycle_count: cycles.len(),
            ..Inner::default()
        };

        for (id, cycle) in cycles.iter().enumerate() {
            for pool in cycle.pools() {
                let owners = inner.cycles_by_pool.entry(*pool).or_default();
                if !owners.contains(&id) {
                    owners.push(id);
                }
            }
            inner.dirty.insert(id);
        }

        Self {
            inner: RwLock::new(inner),
            generations: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies one reserve observation.
    ///
    /// Returns `false` without touching state when the pool is unknown, the
    /// `(block, sequence)` pair is not strictly newer than the stored
    /// provenance, or `generation` is older than the pool's accepted one.
    pub fn apply(
        &self,
        pool: Address,
        reserve_a: U256,
        reserve_b: U256,
        block: u64,
        sequence: u64,
        generation: u64,
    ) -> bool {
        self.write().apply(&ReserveUpdate {
            pool,
            reserve_a,
            reserve_b,
            block,
            sequence,
            generation,
        })
    }

    /// Applies a drained batch under a single write lock.
    ///
    /// Returns how many updates were accepted.
    pub fn apply_batch(&self, updates: &[ReserveUpdate]) -> usize {
        let mut inner = self.write();
        updates.iter().filter(|update| inner.apply(update)).count()
    }

    /// Starts a new connection lifetime for `feed` and returns its generation.
    pub fn begin_generation(&self, feed: FeedKind) -> u64 {
        self.generations[feed.index()].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Generation of the live (or most recent) connection for `feed`.
    pub fn current_generation_for(&self, feed: FeedKind) -> u64 {
        self.generations[feed.index()].load(Ordering::Acquire)
    }

    pub fn snapshot(&self, pool: Address) -> Option<PoolSnapshot> {
        self.read().pools.get(&pool).cloned()
    }

    /// Consistent snapshot of several pools, or `None` if any is unknown.
    pub fn snapshot_many(&self, pools: &[Address]) -> Option<Vec<PoolSnapshot>> {
        let inner = self.read();
        pools
            .iter()
            .map(|address| inner.pools.get(address).cloned())
            .collect()
    }

    pub fn snapshot_all(&self) -> Vec<PoolSnapshot> {
        let mut pools: Vec<PoolSnapshot> = self.read().pools.values().cloned().collect();
        pools.sort_by_key(|pool| pool.address);
        pools
    }

    pub fn pool_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.read().pools.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn cycles_for_pool(&self, pool: Address) -> Vec<CycleId> {
        self.read()
            .cycles_by_pool
            .get(&pool)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_dirty(&self, cycle: CycleId) -> bool {
        self.read().dirty.contains(&cycle)
    }

    /// Atomically drains the dirty set, in cycle order.
    pub fn take_dirty(&self) -> Vec<CycleId> {
        let mut inner = self.write();
        std::mem::take(&mut inner.dirty).into_iter().collect()
    }

    pub fn mark_dirty(&self, cycle: CycleId) {
        self.write().dirty.insert(cycle);
    }

    /// Marks every cycle dirty, used after a bulk re-read.
    pub fn mark_all_dirty(&self) {
        let mut inner = self.write();
        let count = inner.cycle_count;
        inner.dirty.extend(0..count);
    }

    pub fn len(&self) -> usize {
        self.read().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const POOL_1: Address = address!("0000000000000000000000000000000000000101");
    const POOL_2: Address = address!("0000000000000000000000000000000000000102");
    const POOL_3: Address = address!("0000000000000000000000000000000000000103");
    const TOKEN_A: Address = address!("00000000000000000000000000000000000000aa");
    const TOKEN_B: Address = address!("00000000000000000000000000000000000000bb");

    fn cycle(id: &str, borrow: Address, swap: Address) -> CycleDefinition {
        CycleDefinition {
            id: id.to_string(),
            borrow_pool: borrow,
            swap_pools: vec![swap],
            borrow_token: TOKEN_A,
            repay_token: TOKEN_B,
            token_path: vec![TOKEN_A, TOKEN_B],
        }
    }

    fn store() -> PoolStore {
        let pools = vec![
            PoolSnapshot::new(POOL_1, TOKEN_A, TOKEN_B),
            PoolSnapshot::new(POOL_2, TOKEN_A, TOKEN_B),
            PoolSnapshot::new(POOL_3, TOKEN_A, TOKEN_B),
        ];
        let cycles = vec![cycle("c0", POOL_1, POOL_2), cycle("c1", POOL_2, POOL_3)];
        PoolStore::new(pools, &cycles)
    }

    fn reserves(store: &PoolStore, pool: Address) -> (u64, u64) {
        let snapshot = store.snapshot(pool).expect("pool should exist");
        (snapshot.reserve_a.to::<u64>(), snapshot.reserve_b.to::<u64>())
    }

    #[test]
    fn every_cycle_starts_dirty() {
        let store = store();
        assert_eq!(store.take_dirty(), vec![0, 1]);
        assert!(store.take_dirty().is_empty());
    }

    #[test]
    fn apply_requires_strictly_newer_provenance() {
        let store = store();
        assert!(store.apply(POOL_1, U256::from(10u64), U256::from(20u64), 5, 3, 0));
        // Same provenance is not strictly newer.
        assert!(!store.apply(POOL_1, U256::from(11u64), U256::from(21u64), 5, 3, 0));
        // Older sequence in the same block.
        assert!(!store.apply(POOL_1, U256::from(12u64), U256::from(22u64), 5, 2, 0));
        // Older block with a larger sequence.
        assert!(!store.apply(POOL_1, U256::from(13u64), U256::from(23u64), 4, 99, 0));
        assert_eq!(reserves(&store, POOL_1), (10, 20));

        assert!(store.apply(POOL_1, U256::from(14u64), U256::from(24u64), 5, 4, 0));
        assert_eq!(reserves(&store, POOL_1), (14, 24));
    }

    #[test]
    fn out_of_order_events_converge_to_greatest_provenance() {
        let store = store();
        let events = [(7u64, 1u64, 70u64), (6, 9, 69), (7, 4, 74), (7, 2, 72), (5, 0, 50)];
        for (block, sequence, value) in events {
            store.apply(POOL_2, U256::from(value), U256::from(value), block, sequence, 0);
        }
        assert_eq!(reserves(&store, POOL_2), (74, 74));
        let snapshot = store.snapshot(POOL_2).expect("pool should exist");
        assert_eq!(snapshot.last_update_block, 7);
        assert_eq!(snapshot.last_update_sequence, 4);
    }

    #[test]
    fn superseded_generation_is_rejected() {
        let store = store();
        let old = store.current_generation_for(FeedKind::PoolEvents);
        let new = store.begin_generation(FeedKind::PoolEvents);
        assert_eq!(new, old + 1);

        assert!(store.apply(POOL_1, U256::from(1u64), U256::from(1u64), 10, 0, new));
        // A late frame from the old connection, even with newer provenance.
        assert!(!store.apply(POOL_1, U256::from(2u64), U256::from(2u64), 11, 0, old));
        assert_eq!(reserves(&store, POOL_1), (1, 1));
    }

    #[test]
    fn apply_marks_only_owning_cycles_dirty() {
        let store = store();
        store.take_dirty();

        assert!(store.apply(POOL_3, U256::from(1u64), U256::from(1u64), 1, 0, 0));
        assert!(!store.is_dirty(0));
        assert!(store.is_dirty(1));

        assert!(store.apply(POOL_2, U256::from(1u64), U256::from(1u64), 1, 0, 0));
        assert_eq!(store.take_dirty(), vec![0, 1]);
    }

    #[test]
    fn unknown_pool_is_ignored() {
        let store = store();
        let stranger = address!("00000000000000000000000000000000000009ff");
        assert!(!store.apply(stranger, U256::from(1u64), U256::from(1u64), 1, 0, 0));
        assert!(store.snapshot_many(&[POOL_1, stranger]).is_none());
    }

    #[test]
    fn batch_apply_counts_accepted_updates() {
        let store = store();
        let update = |pool, block| ReserveUpdate {
            pool,
            reserve_a: U256::from(block),
            reserve_b: U256::from(block),
            block,
            sequence: 0,
            generation: 0,
        };
        let accepted = store.apply_batch(&[update(POOL_1, 3), update(POOL_1, 2), update(POOL_2, 3)]);
        assert_eq!(accepted, 2);
        assert_eq!(reserves(&store, POOL_1), (3, 3));
    }
}
