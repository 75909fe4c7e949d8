//! Pool registry and validated cycle paths loaded from a JSON file.
//!
//! The registry is read once at startup. Every cycle is validated before the
//! engine starts: a cycle borrows one token of its borrow pool, walks the
//! swap pools hop by hop (each hop must trade the token produced by the
//! previous one) and must end on the borrow pool's other token, which is the
//! repay token. Any violation is a fatal configuration error.
//!
//! ```json
//! {
//!   "wrapped_native": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
//!   "tokens": [{ "address": "0x…", "decimals": 18, "symbol": "WETH" }],
//!   "pools": [{ "address": "0x…", "token0": "0x…", "token1": "0x…", "exchange": "uniswap_v2" }],
//!   "cycles": [{ "id": "weth-usdc-1", "borrow_pool": "0x…", "borrow_token": "0x…", "swap_pools": ["0x…"] }],
//!   "routers": [{ "address": "0x…", "name": "Uniswap V2 Router02", "exchange": "uniswap_v2" }],
//!   "settings": { "quiescence_ms": 75 }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use alloy::primitives::Address;
use eyre::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{Fee, PoolKind, PoolSnapshot, Token};

/// Cycle or pool definition that cannot be turned into a valid path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pool {pool} is listed more than once")]
    DuplicatePool { pool: Address },
    #[error("cycle id {cycle} is listed more than once")]
    DuplicateCycle { cycle: String },
    #[error("pool {pool} references unknown token {token}")]
    UnknownToken { pool: Address, token: Address },
    #[error("pool {pool} has an invalid fee {numerator}/{denominator}")]
    InvalidFee {
        pool: Address,
        numerator: u32,
        denominator: u32,
    },
    #[error("pool {pool} lists the same token twice")]
    DegeneratePool { pool: Address },
    #[error("cycle {cycle} references unknown pool {pool}")]
    UnknownPool { cycle: String, pool: Address },
    #[error("cycle {cycle} has no swap pools")]
    EmptyPath { cycle: String },
    #[error("cycle {cycle} borrow token {token} is not traded by borrow pool {pool}")]
    BorrowTokenNotInPool {
        cycle: String,
        token: Address,
        pool: Address,
    },
    #[error("cycle {cycle} swaps through its own borrow pool {pool}")]
    ReentrantPath { cycle: String, pool: Address },
    #[error("cycle {cycle} visits pool {pool} more than once")]
    RepeatedPool { cycle: String, pool: Address },
    #[error("cycle {cycle} hop {hop} (pool {pool}) does not trade {token}")]
    BrokenPath {
        cycle: String,
        hop: usize,
        pool: Address,
        token: Address,
    },
    #[error("cycle {cycle} ends on {ends_with} instead of repay token {repay_token}")]
    OpenPath {
        cycle: String,
        ends_with: Address,
        repay_token: Address,
    },
}

/// Profit threshold as configured in the registry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSetting {
    /// Net profit must exceed this many wei.
    AbsoluteWei(u128),
    /// Net profit must exceed `pct`% of the gas cost.
    GasMultiplePct(u32),
}

impl Default for ThresholdSetting {
    fn default() -> Self {
        // 0.01 ETH
        ThresholdSetting::AbsoluteWei(10_000_000_000_000_000)
    }
}

/// Engine tunables. Every field has a default so the `settings` object may
/// be omitted or partial.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Quiet period after the last pool event before the batch is drained.
    pub quiescence_ms: u64,
    /// Upper bound on how long the oldest buffered event may wait.
    pub max_batch_delay_ms: u64,
    /// Maximum wait for a websocket frame before reconnecting.
    pub read_timeout_secs: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_secs: u64,
    /// A full reserve re-read is scheduled every this many blocks.
    pub resync_interval_blocks: u64,
    /// `getReserves` calls per JSON-RPC batch during a bulk re-read.
    pub resync_chunk: usize,
    pub pending_max_age_secs: u64,
    pub block_time_secs: u64,
    pub late_block_threshold_secs: u64,
    pub gas_estimate: u64,
    pub max_gas_limit: u64,
    /// Gas limit as a percentage of the simulated gas use.
    pub gas_limit_pct: u64,
    /// `maxFeePerGas` as a percentage of the current base fee.
    pub max_fee_pct: u64,
    /// Share of net profit paid to the block builder, in percent.
    pub miner_tip_pct: u64,
    pub profit_threshold: ThresholdSetting,
    pub min_simulation_attempts: u32,
    pub fail_threshold_pct: u32,
    pub relay_retries: u32,
    pub relay_retry_delay_ms: u64,
    /// Target blocks for a backrun bundle. On-chain cycles target one block.
    pub backrun_valid_blocks: u64,
    pub max_concurrent_attempts: usize,
    pub executor: Option<Address>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quiescence_ms: 75,
            max_batch_delay_ms: 500,
            read_timeout_secs: 30,
            reconnect_backoff_initial_ms: 500,
            reconnect_backoff_max_secs: 30,
            resync_interval_blocks: 50,
            resync_chunk: 250,
            pending_max_age_secs: 36,
            block_time_secs: 12,
            late_block_threshold_secs: 3,
            gas_estimate: 450_000,
            max_gas_limit: 750_000,
            gas_limit_pct: 125,
            max_fee_pct: 115,
            miner_tip_pct: 90,
            profit_threshold: ThresholdSetting::default(),
            min_simulation_attempts: 10,
            fail_threshold_pct: 80,
            relay_retries: 3,
            relay_retry_delay_ms: 200,
            backrun_valid_blocks: 5,
            max_concurrent_attempts: 4,
            executor: None,
        }
    }
}

/// Router contract whose pending swaps are projected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Router {
    pub address: Address,
    pub name: String,
    pub exchange: String,
}

/// A cycle whose path has been validated against the pool set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleDefinition {
    pub id: String,
    pub borrow_pool: Address,
    pub swap_pools: Vec<Address>,
    pub borrow_token: Address,
    pub repay_token: Address,
    /// Token held after each step: `[borrow_token, …, repay_token]`.
    pub token_path: Vec<Address>,
}

impl CycleDefinition {
    /// Borrow pool followed by the swap pools.
    pub fn pools(&self) -> impl Iterator<Item = &Address> {
        std::iter::once(&self.borrow_pool).chain(self.swap_pools.iter())
    }

    pub fn contains_pool(&self, pool: Address) -> bool {
        self.pools().any(|p| *p == pool)
    }
}

#[derive(Debug, Deserialize)]
struct PoolEntry {
    address: Address,
    token0: Address,
    token1: Address,
    #[serde(default)]
    kind: PoolKind,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    fee: Option<Fee>,
}

#[derive(Debug, Deserialize)]
struct CycleEntry {
    id: String,
    borrow_pool: Address,
    borrow_token: Address,
    swap_pools: Vec<Address>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    wrapped_native: Address,
    tokens: Vec<Token>,
    pools: Vec<PoolEntry>,
    cycles: Vec<CycleEntry>,
    #[serde(default)]
    routers: Vec<Router>,
    #[serde(default)]
    settings: Settings,
}

/// Tokens, pools, validated cycles and routers known to the engine.
#[derive(Debug, Clone)]
pub struct Registry {
    pub wrapped_native: Address,
    pub tokens: HashMap<Address, Token>,
    /// Pools with zero reserves. Reserves arrive through the bulk re-read.
    pub pools: Vec<PoolSnapshot>,
    pub cycles: Vec<CycleDefinition>,
    pub routers: Vec<Router>,
    pub settings: Settings,
}

impl Registry {
    /// Loads and validates a registry file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid JSON, or any
    /// pool or cycle fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read registry file {}", path.display()))?;
        Self::from_json(&contents)
            .wrap_err_with(|| format!("invalid registry file {}", path.display()))
    }

    /// Parses and validates a registry from JSON text.
    ///
    /// # Errors
    /// Returns error on malformed JSON or on the first validation failure.
    pub fn from_json(contents: &str) -> Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(contents).wrap_err("failed to parse registry JSON")?;

        let tokens: HashMap<Address, Token> = file
            .tokens
            .into_iter()
            .map(|token| (token.address, token))
            .collect();

        let mut pools = Vec::with_capacity(file.pools.len());
        let mut by_address: HashMap<Address, usize> = HashMap::new();
        for entry in file.pools {
            let pool = build_pool(entry, &tokens)?;
            if by_address.insert(pool.address, pools.len()).is_some() {
                return Err(RegistryError::DuplicatePool { pool: pool.address }.into());
            }
            pools.push(pool);
        }

        let mut seen_ids = HashSet::new();
        let mut cycles = Vec::with_capacity(file.cycles.len());
        for entry in file.cycles {
            if !seen_ids.insert(entry.id.clone()) {
                return Err(RegistryError::DuplicateCycle { cycle: entry.id }.into());
            }
            let lookup = |address: &Address| by_address.get(address).map(|idx| &pools[*idx]);
            cycles.push(validate_cycle(
                &entry.id,
                entry.borrow_pool,
                entry.borrow_token,
                &entry.swap_pools,
                lookup,
            )?);
        }

        tracing::debug!(
            tokens = tokens.len(),
            pools = pools.len(),
            cycles = cycles.len(),
            routers = file.routers.len(),
            "registry loaded"
        );

        Ok(Self {
            wrapped_native: file.wrapped_native,
            tokens,
            pools,
            cycles,
            routers: file.routers,
            settings: file.settings,
        })
    }

    /// Drops blacklisted cycles, returning how many were removed.
    pub fn remove_cycles(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.cycles.len();
        self.cycles.retain(|cycle| !ids.contains(&cycle.id));
        before - self.cycles.len()
    }

    pub fn pool(&self, address: Address) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|pool| pool.address == address)
    }

    pub fn router(&self, address: Address) -> Option<&Router> {
        self.routers.iter().find(|router| router.address == address)
    }
}

fn build_pool(entry: PoolEntry, tokens: &HashMap<Address, Token>) -> Result<PoolSnapshot, RegistryError> {
    for token in [entry.token0, entry.token1] {
        if !tokens.contains_key(&token) {
            return Err(RegistryError::UnknownToken {
                pool: entry.address,
                token,
            });
        }
    }
    if entry.token0 == entry.token1 {
        return Err(RegistryError::DegeneratePool {
            pool: entry.address,
        });
    }

    let fee = entry.fee.unwrap_or_default();
    if !fee.is_valid() {
        return Err(RegistryError::InvalidFee {
            pool: entry.address,
            numerator: fee.numerator,
            denominator: fee.denominator,
        });
    }

    let mut pool = PoolSnapshot::new(entry.address, entry.token0, entry.token1);
    pool.fee = fee;
    pool.kind = entry.kind;
    pool.exchange = entry.exchange;
    Ok(pool)
}

/// Validates one cycle path against the known pools.
///
/// # Errors
/// Returns the first [`RegistryError`] found while walking the path.
pub fn validate_cycle<'a, F>(
    id: &str,
    borrow_pool: Address,
    borrow_token: Address,
    swap_pools: &[Address],
    lookup: F,
) -> Result<CycleDefinition, RegistryError>
where
    F: Fn(&Address) -> Option<&'a PoolSnapshot>,
{
    let unknown = |pool: Address| RegistryError::UnknownPool {
        cycle: id.to_string(),
        pool,
    };

    let borrow = lookup(&borrow_pool).ok_or_else(|| unknown(borrow_pool))?;
    let repay_token = borrow
        .other_token(borrow_token)
        .ok_or_else(|| RegistryError::BorrowTokenNotInPool {
            cycle: id.to_string(),
            token: borrow_token,
            pool: borrow_pool,
        })?;

    if swap_pools.is_empty() {
        return Err(RegistryError::EmptyPath {
            cycle: id.to_string(),
        });
    }

    let mut visited = HashSet::with_capacity(swap_pools.len());
    let mut token_path = Vec::with_capacity(swap_pools.len() + 1);
    token_path.push(borrow_token);
    let mut holding = borrow_token;

    for (hop, address) in swap_pools.iter().enumerate() {
        if *address == borrow_pool {
            return Err(RegistryError::ReentrantPath {
                cycle: id.to_string(),
                pool: borrow_pool,
            });
        }
        if !visited.insert(*address) {
            return Err(RegistryError::RepeatedPool {
                cycle: id.to_string(),
                pool: *address,
            });
        }
        let pool = lookup(address).ok_or_else(|| unknown(*address))?;
        holding = pool
            .other_token(holding)
            .ok_or_else(|| RegistryError::BrokenPath {
                cycle: id.to_string(),
                hop,
                pool: *address,
                token: holding,
            })?;
        token_path.push(holding);
    }

    if holding != repay_token {
        return Err(RegistryError::OpenPath {
            cycle: id.to_string(),
            ends_with: holding,
            repay_token,
        });
    }

    Ok(CycleDefinition {
        id: id.to_string(),
        borrow_pool,
        swap_pools: swap_pools.to_vec(),
        borrow_token,
        repay_token,
        token_path,
    })
}
