//! Shared fixtures: a three-pool registry, seeded stores and in-memory
//! doubles for the relay, chain and signer seams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::{address, Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::Result;
use flash_data::pipeline::Health;
use flash_data::rpc::{PoolReserves, ReceiptStatus};
use flash_data::store::Store;
use flash_data::types::{ChainHead, FeedKind};
use flash_data::{PoolStore, Registry};
use flash_exec::chain::ChainReader;
use flash_exec::relay::{BundleRelay, RelayError, SimulationReport, TxSimulation};
use serde_json::json;

pub const WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
pub const USDC: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
pub const DAI: Address = address!("6B175474E89094C44Da98b954EedeAC495271d0F");
pub const ROUTER: Address = address!("7a250d5630B4cF539739dF2C5dAcb4c659F2488D");
pub const EXECUTOR: Address = address!("00000000000000000000000000000000000e0e0e");

/// USDC/WETH, the borrow pool.
pub const POOL_USDC_WETH: Address = address!("1111111111111111111111111111111111111111");
pub const POOL_DAI_USDC: Address = address!("2222222222222222222222222222222222222222");
pub const POOL_DAI_WETH: Address = address!("3333333333333333333333333333333333333333");

pub const ETH: u128 = 1_000_000_000_000_000_000;
pub const GWEI: u128 = 1_000_000_000;

/// One cycle: borrow USDC from USDC/WETH, USDC -> DAI -> WETH, repay WETH.
pub fn registry_json() -> serde_json::Value {
    json!({
        "wrapped_native": WETH,
        "tokens": [
            { "address": WETH, "decimals": 18, "symbol": "WETH" },
            { "address": USDC, "decimals": 18, "symbol": "USDC" },
            { "address": DAI, "decimals": 18, "symbol": "DAI" }
        ],
        "pools": [
            { "address": POOL_USDC_WETH, "token0": USDC, "token1": WETH, "exchange": "uniswap_v2" },
            { "address": POOL_DAI_USDC, "token0": DAI, "token1": USDC, "exchange": "uniswap_v2" },
            { "address": POOL_DAI_WETH, "token0": DAI, "token1": WETH, "exchange": "uniswap_v2" }
        ],
        "cycles": [
            {
                "id": "usdc-dai-weth",
                "borrow_pool": POOL_USDC_WETH,
                "borrow_token": USDC,
                "swap_pools": [POOL_DAI_USDC, POOL_DAI_WETH]
            }
        ],
        "routers": [
            { "address": ROUTER, "name": "Uniswap V2 Router02", "exchange": "uniswap_v2" }
        ],
        "settings": {
            "executor": EXECUTOR,
            "profit_threshold": { "absolute_wei": 0 },
            "min_simulation_attempts": 3,
            "fail_threshold_pct": 50
        }
    })
}

pub fn test_registry() -> Registry {
    Registry::from_json(&registry_json().to_string()).expect("fixture registry should validate")
}

pub fn eth(amount: u128) -> U256 {
    U256::from(amount * ETH)
}

/// Reserves that leave roughly 10% more WETH per DAI in the last pool.
pub fn profitable_reserves() -> Vec<(Address, U256, U256)> {
    vec![
        (POOL_USDC_WETH, eth(1_000), eth(1_000)),
        (POOL_DAI_USDC, eth(1_000), eth(1_000)),
        (POOL_DAI_WETH, eth(1_000), eth(1_100)),
    ]
}

/// Store built from the registry with `reserves` applied at block 1.
pub fn seeded_store(registry: &Registry, reserves: &[(Address, U256, U256)]) -> PoolStore {
    let store = PoolStore::new(registry.pools.clone(), &registry.cycles);
    for (pool, reserve_a, reserve_b) in reserves {
        assert!(
            store.apply(*pool, *reserve_a, *reserve_b, 1, 0, 0),
            "seed reserves should apply"
        );
    }
    store
}

pub fn memory_store() -> Store {
    Store::new(":memory:").expect("in-memory store should always open")
}

/// Health with every feed live, no pending re-read and a fresh head.
pub fn healthy(block: u64, base_fee: u128) -> Arc<Health> {
    let health = Arc::new(Health::new(12, 3));
    for feed in FeedKind::ALL {
        health.set_live(feed, true);
    }
    health.set_resync_pending(false);
    health.record_head(ChainHead {
        number: block,
        timestamp: chrono::Utc::now().timestamp() as u64,
        base_fee,
    });
    health
}

/// Relay double that records every call.
pub struct MockRelay {
    pub account: Address,
    pub gas_used: u64,
    pub revert: Mutex<Option<String>>,
    pub simulated: Mutex<Vec<(Vec<Bytes>, u64)>>,
    pub sent: Mutex<Vec<(Vec<Bytes>, u64)>>,
}

impl MockRelay {
    pub fn new(account: Address, gas_used: u64) -> Self {
        Self {
            account,
            gas_used,
            revert: Mutex::new(None),
            simulated: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn reverting(account: Address, reason: &str) -> Self {
        let relay = Self::new(account, 0);
        *relay.revert.lock().expect("lock") = Some(reason.to_string());
        relay
    }

    pub fn sent(&self) -> Vec<(Vec<Bytes>, u64)> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn simulations(&self) -> usize {
        self.simulated.lock().expect("lock").len()
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    async fn simulate(&self, txs: &[Bytes], block: u64) -> Result<SimulationReport, RelayError> {
        self.simulated
            .lock()
            .expect("lock")
            .push((txs.to_vec(), block));
        let revert = self.revert.lock().expect("lock").clone();
        let last = txs.len().saturating_sub(1);
        let results = txs
            .iter()
            .enumerate()
            .map(|(index, _)| {
                let ours = index == last;
                TxSimulation {
                    tx_hash: B256::with_last_byte(index as u8),
                    gas_used: if ours { self.gas_used } else { 21_000 },
                    error: None,
                    revert: if ours { revert.clone() } else { None },
                    from: Some(if ours { self.account } else { Address::repeat_byte(0x99) }),
                }
            })
            .collect::<Vec<_>>();
        Ok(SimulationReport {
            bundle_hash: Some(B256::repeat_byte(0xbb)),
            total_gas_used: results.iter().map(|tx| tx.gas_used).sum(),
            results,
        })
    }

    async fn send(&self, txs: &[Bytes], block: u64) -> Result<B256, RelayError> {
        self.sent.lock().expect("lock").push((txs.to_vec(), block));
        Ok(B256::repeat_byte(0xbb))
    }
}

/// Chain double with settable reserves and receipt outcome.
pub struct MockChain {
    pub block: u64,
    pub reserves: Mutex<HashMap<Address, (U256, U256)>>,
    pub included: Mutex<bool>,
}

impl MockChain {
    pub fn new(block: u64, reserves: &[(Address, U256, U256)]) -> Self {
        Self {
            block,
            reserves: Mutex::new(
                reserves
                    .iter()
                    .map(|(pool, a, b)| (*pool, (*a, *b)))
                    .collect(),
            ),
            included: Mutex::new(true),
        }
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.block)
    }

    async fn reserves_at(&self, pools: &[Address], _block: u64) -> Result<Vec<PoolReserves>> {
        let reserves = self.reserves.lock().expect("lock");
        Ok(pools
            .iter()
            .filter_map(|pool| {
                reserves.get(pool).map(|(reserve0, reserve1)| PoolReserves {
                    pool: *pool,
                    reserve0: *reserve0,
                    reserve1: *reserve1,
                })
            })
            .collect())
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64> {
        Ok(42)
    }

    async fn receipt(&self, _hash: B256) -> Result<Option<ReceiptStatus>> {
        let included = *self.included.lock().expect("lock");
        Ok(included.then_some(ReceiptStatus {
            success: true,
            block_number: self.block + 1,
        }))
    }
}
