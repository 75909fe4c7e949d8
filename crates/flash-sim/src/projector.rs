//! Hypothetical pool states after a pending router swap lands.
//!
//! The projector never writes to the store. It reads a consistent snapshot
//! of the pools a pending swap would touch, replays the swap with the same
//! exact math the optimizer uses and returns the resulting reserves as an
//! overlay together with every cycle routed through those pools.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, B256, U256};
use flash_data::types::{CycleId, PendingTransaction, PoolSnapshot};
use flash_data::{PoolStore, Registry};
use thiserror::Error;

use crate::decoder::{decode_router_call, DecodeError, DecodedSwap, SwapShape};
use crate::math::MathError;
use crate::quote::{reserves_after_swap, SwapQuoter};

/// Reserve overrides implied by one pending transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub trigger: B256,
    /// Pool address to `(reserve_a, reserve_b)` after the swap.
    pub pools: HashMap<Address, (U256, U256)>,
    /// Cycles routed through any overridden pool.
    pub cycles: Vec<CycleId>,
}

/// Why a pending transaction produced no projection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("transaction is not sent to a monitored router")]
    NotRouter,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("native-currency swap path does not start or end with the wrapped token")]
    NativeMismatch,
    #[error("token {0} is not monitored")]
    UnmonitoredToken(Address),
    #[error("no {exchange} pool for {token_in} -> {token_out}")]
    UnknownPool {
        exchange: String,
        token_in: Address,
        token_out: Address,
    },
    #[error("swap path visits pool {0} twice")]
    RepeatedPool(Address),
    #[error("hop through {pool} needs {requested}, pool holds {available}")]
    ExceedsReserve {
        pool: Address,
        requested: U256,
        available: U256,
    },
    #[error("swap needs input {required}, caller allows {limit}")]
    ExceedsInputLimit { required: U256, limit: U256 },
    #[error("swap yields {received}, caller requires {minimum}")]
    BelowOutputMinimum { received: U256, minimum: U256 },
    #[error(transparent)]
    Math(#[from] MathError),
}

/// Turns pending router swaps into reserve overlays.
#[derive(Debug, Clone)]
pub struct MempoolProjector {
    wrapped_native: Address,
    /// Router address to the exchange label whose pools it trades.
    routers: HashMap<Address, String>,
    tokens: HashSet<Address>,
    /// `(exchange, lower token, higher token)` to pool address.
    pairs: HashMap<(String, Address, Address), Address>,
    quoter: SwapQuoter,
}

fn pair_key(exchange: &str, a: Address, b: Address) -> (String, Address, Address) {
    if a < b {
        (exchange.to_string(), a, b)
    } else {
        (exchange.to_string(), b, a)
    }
}

impl MempoolProjector {
    pub fn new(registry: &Registry) -> Self {
        let pairs = registry
            .pools
            .iter()
            .map(|pool| (pair_key(&pool.exchange, pool.token_a, pool.token_b), pool.address))
            .collect();
        Self {
            wrapped_native: registry.wrapped_native,
            routers: registry
                .routers
                .iter()
                .map(|router| (router.address, router.exchange.clone()))
                .collect(),
            tokens: registry.tokens.keys().copied().collect(),
            pairs,
            quoter: SwapQuoter::new(),
        }
    }

    pub fn with_quoter(mut self, quoter: SwapQuoter) -> Self {
        self.quoter = quoter;
        self
    }

    pub fn router_addresses(&self) -> HashSet<Address> {
        self.routers.keys().copied().collect()
    }

    /// Projects the reserves left behind by `tx`.
    ///
    /// # Errors
    /// Returns a [`ProjectionError`] when the transaction is not a
    /// supported swap over monitored pools, or when it would revert.
    pub fn project(
        &self,
        tx: &PendingTransaction,
        store: &PoolStore,
    ) -> Result<Projection, ProjectionError> {
        let exchange = tx
            .to
            .and_then(|to| self.routers.get(&to))
            .ok_or(ProjectionError::NotRouter)?;
        let swap = decode_router_call(&tx.input, tx.value)?;
        self.check_tokens(&swap)?;

        let addresses = self.resolve_pools(exchange, &swap.path)?;
        let pools = store
            .snapshot_many(&addresses)
            .ok_or(ProjectionError::UnknownPool {
                exchange: exchange.clone(),
                token_in: swap.path[0],
                token_out: swap.path[swap.path.len() - 1],
            })?;

        let amounts = match swap.shape {
            SwapShape::ExactInput => self.forward(&swap, &pools)?,
            SwapShape::ExactOutput => self.backward(&swap, &pools)?,
        };

        let mut overrides = HashMap::with_capacity(pools.len());
        let mut cycles = Vec::new();
        for (hop, pool) in pools.iter().enumerate() {
            let reserves =
                reserves_after_swap(pool, swap.path[hop], amounts[hop], amounts[hop + 1])?;
            overrides.insert(pool.address, reserves);
            cycles.extend(store.cycles_for_pool(pool.address));
        }
        cycles.sort_unstable();
        cycles.dedup();

        tracing::trace!(
            tx = %tx.hash,
            pools = overrides.len(),
            cycles = cycles.len(),
            "pending swap projected"
        );

        Ok(Projection {
            trigger: tx.hash,
            pools: overrides,
            cycles,
        })
    }

    fn check_tokens(&self, swap: &DecodedSwap) -> Result<(), ProjectionError> {
        let first = swap.path.first().copied();
        let last = swap.path.last().copied();
        if (swap.native_in && first != Some(self.wrapped_native))
            || (swap.native_out && last != Some(self.wrapped_native))
        {
            return Err(ProjectionError::NativeMismatch);
        }
        match swap.path.iter().find(|token| !self.tokens.contains(*token)) {
            Some(token) => Err(ProjectionError::UnmonitoredToken(*token)),
            None => Ok(()),
        }
    }

    fn resolve_pools(&self, exchange: &str, path: &[Address]) -> Result<Vec<Address>, ProjectionError> {
        let mut seen = HashSet::with_capacity(path.len());
        let mut pools = Vec::with_capacity(path.len().saturating_sub(1));
        for hop in path.windows(2) {
            let pool = *self
                .pairs
                .get(&pair_key(exchange, hop[0], hop[1]))
                .ok_or_else(|| ProjectionError::UnknownPool {
                    exchange: exchange.to_string(),
                    token_in: hop[0],
                    token_out: hop[1],
                })?;
            if !seen.insert(pool) {
                return Err(ProjectionError::RepeatedPool(pool));
            }
            pools.push(pool);
        }
        Ok(pools)
    }

    /// Token amounts at each step of an exact-input swap.
    fn forward(&self, swap: &DecodedSwap, pools: &[PoolSnapshot]) -> Result<Vec<U256>, ProjectionError> {
        let mut amounts = Vec::with_capacity(swap.path.len());
        amounts.push(swap.amount);
        for (hop, pool) in pools.iter().enumerate() {
            let out = self.quoter.quote_out(pool, swap.path[hop], amounts[hop])?;
            check_reserve(pool, swap.path[hop + 1], out)?;
            amounts.push(out);
        }

        let received = amounts[amounts.len() - 1];
        if received < swap.limit {
            return Err(ProjectionError::BelowOutputMinimum {
                received,
                minimum: swap.limit,
            });
        }
        Ok(amounts)
    }

    /// Token amounts at each step of an exact-output swap, walked from the end.
    fn backward(&self, swap: &DecodedSwap, pools: &[PoolSnapshot]) -> Result<Vec<U256>, ProjectionError> {
        let mut amounts = vec![U256::ZERO; swap.path.len()];
        let last = amounts.len() - 1;
        amounts[last] = swap.amount;
        for (hop, pool) in pools.iter().enumerate().rev() {
            let wanted = amounts[hop + 1];
            check_reserve(pool, swap.path[hop + 1], wanted)?;
            amounts[hop] = self.quoter.quote_in(pool, swap.path[hop + 1], wanted)?;
        }

        if amounts[0] > swap.limit {
            return Err(ProjectionError::ExceedsInputLimit {
                required: amounts[0],
                limit: swap.limit,
            });
        }
        Ok(amounts)
    }
}

fn check_reserve(pool: &PoolSnapshot, token_out: Address, amount: U256) -> Result<(), ProjectionError> {
    let available = pool.reserve_of(token_out).ok_or(MathError::TokenNotInPool)?;
    if amount >= available {
        return Err(ProjectionError::ExceedsReserve {
            pool: pool.address,
            requested: amount,
            available,
        });
    }
    Ok(())
}
