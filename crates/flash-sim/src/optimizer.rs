//! Borrow-size search for flash-borrow cycles.
//!
//! For a borrow of `x` the objective is
//! `profit(x) = output_after_path(x) - repay_required(x)`, evaluated with the
//! exact integer quotes of [`crate::math`]. Over constant-product pools the
//! objective is unimodal, so the search brackets the peak from a seed at
//! 1% and 5% of the borrow reserve and then narrows it with an integer
//! golden-section search. Every evaluated point is remembered and the best
//! one wins, which keeps the result correct even where integer rounding
//! makes the objective locally flat.
//!
//! Points where any quote fails score as negative infinity, so the search
//! never leaves the domain where the formulas are defined.

use std::collections::HashMap;

use alloy::primitives::{Address, I256, U256};
use flash_data::registry::CycleDefinition;
use flash_data::types::CycleId;
use flash_data::PoolStore;

use crate::cycle::{CycleBook, HopAmounts, OpportunityResult};
use crate::math::MathError;
use crate::projector::Projection;
use crate::quote::SwapQuoter;
use crate::view::PathSnapshot;

/// Domains this small are scanned point by point.
const EXHAUSTIVE_LIMIT: u64 = 64;
/// Golden-section narrowing stops at this width; the rest is scanned.
const FINAL_WIDTH: u64 = 4;
/// Cap on bracket expansion steps. The step grows geometrically, so this
/// covers the whole 256-bit range.
const MAX_EXPANSIONS: usize = 400;

/// `1 - 1/phi` as a fraction of 1e6.
const GOLDEN_NUM: u64 = 381_966;
/// `phi` as a fraction of 1e6.
const PHI_NUM: u64 = 1_618_034;
const SCALE: u64 = 1_000_000;

/// Profit of one candidate, or `None` where any quote failed.
type Score = Option<I256>;

/// All quantities produced by pushing one borrow amount through a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub borrow_amount: U256,
    pub repay_amount: U256,
    pub final_amount: U256,
    pub profit: I256,
    pub hops: Vec<HopAmounts>,
}

impl Evaluation {
    /// Every hop pays out strictly less than the pool holds of that token.
    pub fn within_reserves(&self, path: &PathSnapshot) -> bool {
        self.hops.iter().zip(path.pools()).all(|(hop, pool)| {
            pool.reserve_of(hop.token_out)
                .is_some_and(|reserve| hop.amount_out < reserve)
        })
    }

    fn into_result(self) -> OpportunityResult {
        OpportunityResult {
            borrow_amount: self.borrow_amount,
            repay_amount: self.repay_amount,
            profit_amount: self.profit.unsigned_abs(),
            hops: self.hops,
        }
    }
}

/// Searches the borrow amount that maximizes a cycle's profit.
#[derive(Debug, Clone)]
pub struct CycleOptimizer {
    quoter: SwapQuoter,
    /// Re-clamp rounds when the best point fails the liquidity check.
    max_rounds: usize,
}

impl Default for CycleOptimizer {
    fn default() -> Self {
        Self::new(SwapQuoter::new())
    }
}

impl CycleOptimizer {
    pub fn new(quoter: SwapQuoter) -> Self {
        Self {
            quoter,
            max_rounds: 8,
        }
    }

    /// Pushes `borrow` through the path and computes the repayment.
    ///
    /// # Errors
    /// Returns the first [`MathError`] raised by any hop.
    pub fn evaluate(
        &self,
        cycle: &CycleDefinition,
        path: &PathSnapshot,
        borrow: U256,
    ) -> Result<Evaluation, MathError> {
        let borrow_pool = path.borrow_pool().ok_or(MathError::EmptyReserves)?;
        let repay = self.quoter.quote_in(borrow_pool, cycle.borrow_token, borrow)?;

        let mut hops = Vec::with_capacity(path.pools().len());
        hops.push(HopAmounts {
            pool: borrow_pool.address,
            token_in: cycle.repay_token,
            token_out: cycle.borrow_token,
            amount_in: repay,
            amount_out: borrow,
        });

        let mut holding = cycle.borrow_token;
        let mut amount = borrow;
        for pool in path.swap_pools() {
            let token_out = pool.other_token(holding).ok_or(MathError::TokenNotInPool)?;
            let out = self.quoter.quote_out(pool, holding, amount)?;
            hops.push(HopAmounts {
                pool: pool.address,
                token_in: holding,
                token_out,
                amount_in: amount,
                amount_out: out,
            });
            holding = token_out;
            amount = out;
        }
        if holding != cycle.repay_token {
            return Err(MathError::TokenNotInPool);
        }

        let profit = signed(amount)?
            .checked_sub(signed(repay)?)
            .ok_or(MathError::Overflow)?;

        Ok(Evaluation {
            borrow_amount: borrow,
            repay_amount: repay,
            final_amount: amount,
            profit,
            hops,
        })
    }

    fn score(&self, cycle: &CycleDefinition, path: &PathSnapshot, borrow: U256) -> Score {
        self.evaluate(cycle, path, borrow).ok().map(|eval| eval.profit)
    }

    /// Best accepted borrow for the cycle, or `None` if nothing is profitable.
    ///
    /// Acceptance requires a positive profit and every hop paying out less
    /// than its pool's reserve. A point failing the liquidity check lowers
    /// the upper bound below it and the search repeats.
    pub fn optimize(&self, cycle: &CycleDefinition, path: &PathSnapshot) -> Option<OpportunityResult> {
        if path.has_empty_pool() {
            return None;
        }
        let reserve = path.borrow_pool()?.reserve_of(cycle.borrow_token)?;
        if reserve <= U256::from(1u8) {
            return None;
        }

        let low = U256::from(1u8);
        let mut high = reserve - U256::from(1u8);
        for _ in 0..self.max_rounds {
            let (borrow, profit) = self.search(low, high, |x| self.score(cycle, path, x))?;
            if profit <= I256::ZERO {
                return None;
            }
            let evaluation = self.evaluate(cycle, path, borrow).ok()?;
            if evaluation.within_reserves(path) {
                return Some(evaluation.into_result());
            }
            if borrow <= low {
                return None;
            }
            high = borrow - U256::from(1u8);
        }
        None
    }

    /// Maximizes `score` over `[low, high]`, returning the best point seen.
    fn search<F>(&self, low: U256, high: U256, score: F) -> Option<(U256, I256)>
    where
        F: Fn(U256) -> Score,
    {
        let mut best: Option<(U256, I256)> = None;
        let mut probe = |x: U256| -> Score {
            let value = score(x);
            if let Some(profit) = value {
                if best.map_or(true, |(_, current)| profit > current) {
                    best = Some((x, profit));
                }
            }
            value
        };

        if high - low < U256::from(EXHAUSTIVE_LIMIT) {
            let mut x = low;
            while x <= high {
                probe(x);
                x += U256::from(1u8);
            }
            return best;
        }

        let reserve = high + U256::from(1u8);
        let mut a = (reserve / U256::from(100u8)).clamp(low, high);
        let mut b = (reserve / U256::from(20u8)).clamp(low, high);
        if a >= b {
            a = low;
        }
        let mut fa = probe(a);
        let mut fb = probe(b);

        let (mut left, mut right) = (low, high);
        if fb >= fa {
            for _ in 0..MAX_EXPANSIONS {
                let c = b.saturating_add(scale(b - a, PHI_NUM)).min(high);
                let fc = probe(c);
                if fc < fb || c == high {
                    left = a;
                    right = c;
                    break;
                }
                (a, fa, b, fb) = (b, fb, c, fc);
            }
        } else {
            for _ in 0..MAX_EXPANSIONS {
                let c = a.saturating_sub(scale(b - a, PHI_NUM)).max(low);
                let fc = probe(c);
                if fc < fa || c == low {
                    left = c;
                    right = b;
                    break;
                }
                (b, fb, a, fa) = (a, fa, c, fc);
            }
        }

        while right - left > U256::from(FINAL_WIDTH) {
            let step = scale(right - left, GOLDEN_NUM);
            let m1 = left + step;
            let m2 = right - step;
            if probe(m1) < probe(m2) {
                left = m1;
            } else {
                right = m2;
            }
        }

        let mut x = left;
        while x <= right {
            probe(x);
            x += U256::from(1u8);
        }
        best
    }
}

/// `value * num / SCALE` without overflowing for any `value`.
fn scale(value: U256, num: u64) -> U256 {
    let scale = U256::from(SCALE);
    let num = U256::from(num);
    (value / scale).saturating_mul(num) + (value % scale) * num / scale
}

fn signed(value: U256) -> Result<I256, MathError> {
    I256::try_from(value).map_err(|_| MathError::Overflow)
}

/// Re-optimizes every dirty cycle against the live store.
///
/// Returns the cycles that now hold an opportunity.
pub fn optimize_dirty(store: &PoolStore, book: &CycleBook, optimizer: &CycleOptimizer) -> Vec<CycleId> {
    let dirty = store.take_dirty();
    optimize_cycles(store, book, optimizer, &dirty)
}

/// Re-optimizes the given cycles, writing results (or the cleared
/// sentinel) into `book.best`.
pub fn optimize_cycles(
    store: &PoolStore,
    book: &CycleBook,
    optimizer: &CycleOptimizer,
    ids: &[CycleId],
) -> Vec<CycleId> {
    let mut found = Vec::new();
    for &id in ids {
        if !book.is_active(id) {
            continue;
        }
        let Some(cycle) = book.definition(id) else {
            continue;
        };
        let result = PathSnapshot::capture(store, cycle)
            .and_then(|path| optimizer.optimize(cycle, &path))
            .unwrap_or_default();

        if !result.is_cleared() {
            tracing::debug!(
                cycle = %cycle.id,
                borrow = %result.borrow_amount,
                profit = %result.profit_amount,
                "opportunity found"
            );
            found.push(id);
        }
        book.record_best(id, result);
    }
    found
}

/// Evaluates the cycles touched by a projected pending swap, writing into
/// `book.best_future`. The overlay is consumed here and never stored.
pub fn optimize_projection(
    store: &PoolStore,
    book: &CycleBook,
    optimizer: &CycleOptimizer,
    projection: &Projection,
) -> Vec<CycleId> {
    let overrides: &HashMap<Address, (U256, U256)> = &projection.pools;
    let mut found = Vec::new();
    for &id in &projection.cycles {
        if !book.is_active(id) {
            continue;
        }
        let Some(cycle) = book.definition(id) else {
            continue;
        };
        let result = PathSnapshot::capture(store, cycle)
            .map(|path| path.with_overrides(overrides))
            .and_then(|path| optimizer.optimize(cycle, &path))
            .unwrap_or_default();

        if !result.is_cleared() {
            tracing::debug!(
                cycle = %cycle.id,
                trigger = %projection.trigger,
                profit = %result.profit_amount,
                "backrun opportunity found"
            );
            found.push(id);
        }
        book.record_future(id, projection.trigger, result);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, B256};
    use flash_data::registry::validate_cycle;
    use flash_data::types::{Fee, PoolSnapshot};

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");
    const C: Address = address!("00000000000000000000000000000000000000cc");
    const P0: Address = address!("0000000000000000000000000000000000000001");
    const P1: Address = address!("0000000000000000000000000000000000000002");
    const P2: Address = address!("0000000000000000000000000000000000000003");

    fn pool(address: Address, token_a: Address, token_b: Address, ra: u128, rb: u128) -> PoolSnapshot {
        PoolSnapshot::new(address, token_a, token_b).with_reserves(U256::from(ra), U256::from(rb))
    }

    fn two_hop(borrow: (u128, u128), swap: (u128, u128)) -> (CycleDefinition, PathSnapshot) {
        let pools = [
            pool(P0, A, B, borrow.0, borrow.1),
            pool(P1, A, B, swap.0, swap.1),
        ];
        let cycle = validate_cycle("a-b", P0, B, &[P1], |addr| {
            pools.iter().find(|pool| pool.address == *addr)
        })
        .expect("two-hop cycle should validate");
        (cycle, PathSnapshot::new(pools.to_vec()))
    }

    /// Reserves of every pool after executing `result`.
    fn after_trade(path: &PathSnapshot, result: &OpportunityResult) -> PathSnapshot {
        let pools = path
            .pools()
            .iter()
            .zip(&result.hops)
            .map(|(pool, hop)| {
                let (ra, rb) = crate::quote::reserves_after_swap(pool, hop.token_in, hop.amount_in, hop.amount_out)
                    .expect("trade should fit in reserves");
                pool.clone().with_reserves(ra, rb)
            })
            .collect();
        PathSnapshot::new(pools)
    }

    #[test]
    fn finds_profitable_two_hop_borrow() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (1_030_000, 1_000_000));
        let optimizer = CycleOptimizer::default();
        let result = optimizer.optimize(&cycle, &path).expect("cycle should be profitable");

        assert!(result.borrow_amount > U256::ZERO);
        assert!(result.profit_amount > U256::ZERO);
        assert_eq!(result.hops.len(), 2);
        assert_eq!(result.hops[0].amount_out, result.borrow_amount);
        assert_eq!(result.hops[0].amount_in, result.repay_amount);
        assert_eq!(result.hops[1].amount_in, result.borrow_amount);
        assert_eq!(
            result.hops[1].amount_out,
            result.repay_amount + result.profit_amount
        );
    }

    #[test]
    fn post_trade_reserves_admit_no_profit() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (1_030_000, 1_000_000));
        let optimizer = CycleOptimizer::default();
        let result = optimizer.optimize(&cycle, &path).expect("cycle should be profitable");

        let settled = after_trade(&path, &result);
        assert_eq!(optimizer.optimize(&cycle, &settled), None);
    }

    #[test]
    fn balanced_pools_have_no_opportunity() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (1_000_000, 1_000_000));
        assert_eq!(CycleOptimizer::default().optimize(&cycle, &path), None);
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (0, 0));
        assert_eq!(CycleOptimizer::default().optimize(&cycle, &path), None);
    }

    #[test]
    fn tiny_domain_is_scanned_exhaustively() {
        let (cycle, path) = two_hop((40, 40), (400, 40));
        let optimizer = CycleOptimizer::default();
        let result = optimizer.optimize(&cycle, &path).expect("skewed tiny pools are profitable");

        let best = (1u64..40)
            .filter_map(|x| optimizer.evaluate(&cycle, &path, U256::from(x)).ok())
            .map(|eval| eval.profit)
            .max()
            .expect("some point is feasible");
        assert_eq!(I256::try_from(result.profit_amount).expect("fits"), best);
    }

    #[test]
    fn three_hop_cycle_is_evaluated_in_order() {
        let pools = [
            pool(P0, A, B, 1_000_000, 1_000_000),
            pool(P1, B, C, 1_000_000, 1_100_000),
            pool(P2, C, A, 1_000_000, 1_100_000),
        ];
        let cycle = validate_cycle("a-b-c", P0, B, &[P1, P2], |addr| {
            pools.iter().find(|pool| pool.address == *addr)
        })
        .expect("three-hop cycle should validate");
        let path = PathSnapshot::new(pools.to_vec());

        let result = CycleOptimizer::default()
            .optimize(&cycle, &path)
            .expect("three-hop cycle should be profitable");
        let tokens: Vec<(Address, Address)> =
            result.hops.iter().map(|hop| (hop.token_in, hop.token_out)).collect();
        assert_eq!(tokens, vec![(A, B), (B, C), (C, A)]);
        assert_eq!(result.hops[2].amount_in, result.hops[1].amount_out);
    }

    #[test]
    fn fee_changes_the_outcome() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (1_010_000, 1_000_000));
        assert!(CycleOptimizer::default().optimize(&cycle, &path).is_some());

        let mut pools = path.pools().to_vec();
        for pool in &mut pools {
            pool.fee = Fee::new(1, 100);
        }
        let path = PathSnapshot::new(pools);
        assert_eq!(CycleOptimizer::default().optimize(&cycle, &path), None);
    }

    #[test]
    fn dirty_cycles_write_best_and_projection_writes_future() {
        let (cycle, path) = two_hop((1_000_000, 1_000_000), (1_000_000, 1_000_000));
        let store = PoolStore::new(path.pools().to_vec(), std::slice::from_ref(&cycle));
        let book = CycleBook::new(vec![cycle]);
        let optimizer = CycleOptimizer::default();

        assert!(optimize_dirty(&store, &book, &optimizer).is_empty());
        assert!(book.best(0).is_cleared());
        assert_eq!(book.epoch(0), 1);
        // Nothing left to recompute.
        assert!(optimize_dirty(&store, &book, &optimizer).is_empty());
        assert_eq!(book.epoch(0), 1);

        let trigger = B256::repeat_byte(9);
        let projection = Projection {
            trigger,
            pools: HashMap::from([(P1, (U256::from(1_030_000u64), U256::from(1_000_000u64)))]),
            cycles: vec![0],
        };
        assert_eq!(optimize_projection(&store, &book, &optimizer, &projection), vec![0]);
        assert!(!book.best_future(0).is_cleared());
        assert!(book.best(0).is_cleared());
        assert_eq!(book.future_trigger(0), Some(trigger));
        // The overlay never reaches the store.
        assert_eq!(
            store.snapshot(P1).expect("pool exists").reserve_a,
            U256::from(1_000_000u64)
        );
    }
}
