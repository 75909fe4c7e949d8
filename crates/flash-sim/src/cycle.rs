//! Cycle bookkeeping: the best real and speculative opportunity per cycle.
//!
//! The optimizer is the only writer of `best`/`best_future`; the bundler
//! reads them and clears them after a submission. `epoch` increments on every
//! recomputation of `best`, which lets an in-flight submission notice that its
//! cycle was re-optimized from fresher reserves while it was running.

use alloy::primitives::{Address, B256, U256};
use dashmap::DashMap;
use flash_data::registry::CycleDefinition;
use flash_data::types::CycleId;

/// Exact amounts moved through one pool of the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopAmounts {
    pub pool: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
}

/// Best borrow size for a cycle together with every per-pool amount needed
/// to replay it on-chain.
///
/// `hops[0]` is the borrow pool (`amount_out` = borrow, `amount_in` = repay),
/// followed by one entry per swap pool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpportunityResult {
    pub borrow_amount: U256,
    pub repay_amount: U256,
    pub profit_amount: U256,
    pub hops: Vec<HopAmounts>,
}

impl OpportunityResult {
    /// The all-zero "no opportunity" sentinel.
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_cleared(&self) -> bool {
        self.borrow_amount.is_zero()
            && self.repay_amount.is_zero()
            && self.profit_amount.is_zero()
            && self.hops.is_empty()
    }

    pub fn swap_hops(&self) -> &[HopAmounts] {
        self.hops.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
struct CycleState {
    best: OpportunityResult,
    best_future: OpportunityResult,
    /// Pending transaction the speculative result depends on.
    future_trigger: Option<B256>,
    epoch: u64,
}

/// Validated cycles and their mutable results.
#[derive(Debug)]
pub struct CycleBook {
    definitions: Vec<CycleDefinition>,
    states: DashMap<CycleId, CycleState>,
}

impl CycleBook {
    pub fn new(definitions: Vec<CycleDefinition>) -> Self {
        let states = (0..definitions.len())
            .map(|id| (id, CycleState::default()))
            .collect();
        Self {
            definitions,
            states,
        }
    }

    pub fn definition(&self, id: CycleId) -> Option<&CycleDefinition> {
        self.definitions.get(id)
    }

    pub fn definitions(&self) -> &[CycleDefinition] {
        &self.definitions
    }

    pub fn id_of(&self, name: &str) -> Option<CycleId> {
        self.definitions.iter().position(|cycle| cycle.id == name)
    }

    /// Whether the cycle is still eligible (not blacklisted).
    pub fn is_active(&self, id: CycleId) -> bool {
        self.states.contains_key(&id)
    }

    pub fn active_ids(&self) -> Vec<CycleId> {
        let mut ids: Vec<CycleId> = self.states.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Removes a cycle from consideration. Returns whether it was active.
    pub fn deactivate(&self, id: CycleId) -> bool {
        self.states.remove(&id).is_some()
    }

    pub fn best(&self, id: CycleId) -> OpportunityResult {
        self.states
            .get(&id)
            .map(|state| state.best.clone())
            .unwrap_or_default()
    }

    pub fn best_future(&self, id: CycleId) -> OpportunityResult {
        self.states
            .get(&id)
            .map(|state| state.best_future.clone())
            .unwrap_or_default()
    }

    pub fn future_trigger(&self, id: CycleId) -> Option<B256> {
        self.states.get(&id).and_then(|state| state.future_trigger)
    }

    pub fn epoch(&self, id: CycleId) -> u64 {
        self.states.get(&id).map(|state| state.epoch).unwrap_or_default()
    }

    /// Stores a freshly computed result and returns the new epoch.
    pub fn record_best(&self, id: CycleId, result: OpportunityResult) -> Option<u64> {
        let mut state = self.states.get_mut(&id)?;
        state.best = result;
        state.epoch += 1;
        Some(state.epoch)
    }

    pub fn record_future(&self, id: CycleId, trigger: B256, result: OpportunityResult) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.future_trigger = (!result.is_cleared()).then_some(trigger);
            state.best_future = result;
        }
    }

    /// Resets both results to the sentinel after a submission.
    pub fn clear(&self, id: CycleId) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.best = OpportunityResult::cleared();
            state.best_future = OpportunityResult::cleared();
            state.future_trigger = None;
        }
    }

    /// Drops speculative results that depend on any of `resolved`.
    pub fn clear_futures_for(&self, resolved: &[B256]) -> usize {
        let mut cleared = 0;
        for mut state in self.states.iter_mut() {
            if state
                .future_trigger
                .is_some_and(|trigger| resolved.contains(&trigger))
            {
                state.best_future = OpportunityResult::cleared();
                state.future_trigger = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Active cycles whose `best` is not the sentinel.
    pub fn opportunities(&self) -> Vec<(CycleId, OpportunityResult)> {
        let mut found: Vec<(CycleId, OpportunityResult)> = self
            .states
            .iter()
            .filter(|entry| !entry.best.is_cleared())
            .map(|entry| (*entry.key(), entry.best.clone()))
            .collect();
        found.sort_by_key(|(id, _)| *id);
        found
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
