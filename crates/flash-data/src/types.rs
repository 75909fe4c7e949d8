//! Core data types shared across the engine.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Index of a validated cycle inside the registry.
pub type CycleId = usize;

/// ERC-20 token metadata. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

/// Pool pricing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// `x * y = k` pools (Uniswap V2 and forks).
    #[default]
    ConstantProduct,
    /// Tick-indexed pools. Quoted through a plug-in.
    Concentrated,
}

/// Swap fee kept as an exact rational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fee {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fee {
    /// 0.3%, the Uniswap V2 fee.
    pub const STANDARD: Fee = Fee {
        numerator: 3,
        denominator: 1000,
    };

    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// A fee is usable when it is a proper fraction below one.
    pub fn is_valid(&self) -> bool {
        self.denominator > 0 && self.numerator < self.denominator
    }

    /// `denominator - numerator`, the multiplier applied to input amounts.
    pub fn retained(&self) -> u32 {
        self.denominator.saturating_sub(self.numerator)
    }
}

impl Default for Fee {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Point-in-time copy of a pool's reserves and update provenance.
///
/// `token_a`/`token_b` are the on-chain `token0`/`token1` ordering, so
/// `reserve_a`/`reserve_b` map directly onto `getReserves()` and `Sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub address: Address,
    pub token_a: Address,
    pub token_b: Address,
    pub reserve_a: U256,
    pub reserve_b: U256,
    pub fee: Fee,
    pub kind: PoolKind,
    /// Exchange label used to match routers with the pools they trade.
    pub exchange: String,
    pub last_update_block: u64,
    pub last_update_sequence: u64,
    pub source_generation: u64,
}

impl PoolSnapshot {
    /// Creates an empty (zero-reserve) constant-product pool.
    pub fn new(address: Address, token_a: Address, token_b: Address) -> Self {
        Self {
            address,
            token_a,
            token_b,
            reserve_a: U256::ZERO,
            reserve_b: U256::ZERO,
            fee: Fee::STANDARD,
            kind: PoolKind::ConstantProduct,
            exchange: String::new(),
            last_update_block: 0,
            last_update_sequence: 0,
            source_generation: 0,
        }
    }

    /// Returns a copy with the given reserves and unchanged provenance.
    pub fn with_reserves(mut self, reserve_a: U256, reserve_b: U256) -> Self {
        self.reserve_a = reserve_a;
        self.reserve_b = reserve_b;
        self
    }

    pub fn has_token(&self, token: Address) -> bool {
        self.token_a == token || self.token_b == token
    }

    /// The counterpart of `token` in this pool.
    pub fn other_token(&self, token: Address) -> Option<Address> {
        if token == self.token_a {
            Some(self.token_b)
        } else if token == self.token_b {
            Some(self.token_a)
        } else {
            None
        }
    }

    pub fn reserve_of(&self, token: Address) -> Option<U256> {
        if token == self.token_a {
            Some(self.reserve_a)
        } else if token == self.token_b {
            Some(self.reserve_b)
        } else {
            None
        }
    }

    /// `(reserve_in, reserve_out)` for a swap that sells `token_in`.
    pub fn reserves_for(&self, token_in: Address) -> Option<(U256, U256)> {
        if token_in == self.token_a {
            Some((self.reserve_a, self.reserve_b))
        } else if token_in == self.token_b {
            Some((self.reserve_b, self.reserve_a))
        } else {
            None
        }
    }

    /// Pools with either reserve at zero are excluded from path evaluation.
    pub fn is_empty(&self) -> bool {
        self.reserve_a.is_zero() || self.reserve_b.is_zero()
    }
}

/// A reserve observation ready to be applied to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveUpdate {
    pub pool: Address,
    pub reserve_a: U256,
    pub reserve_b: U256,
    pub block: u64,
    pub sequence: u64,
    pub generation: u64,
}

/// Packs `(transactionIndex, logIndex)` into one monotonic per-block key.
pub fn log_sequence(tx_index: u64, log_index: u64) -> u64 {
    (tx_index << 32) | (log_index & 0xffff_ffff)
}

/// Sequence used by bulk re-reads: newer than any log of the same block.
pub const RESYNC_SEQUENCE: u64 = u64::MAX;

/// The three websocket subscriptions the engine keeps alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Blocks,
    PoolEvents,
    PendingTransactions,
}

impl FeedKind {
    pub const ALL: [FeedKind; 3] = [
        FeedKind::Blocks,
        FeedKind::PoolEvents,
        FeedKind::PendingTransactions,
    ];

    pub fn index(self) -> usize {
        match self {
            FeedKind::Blocks => 0,
            FeedKind::PoolEvents => 1,
            FeedKind::PendingTransactions => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Blocks => "blocks",
            FeedKind::PoolEvents => "pool_events",
            FeedKind::PendingTransactions => "pending_transactions",
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest block header fields the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainHead {
    pub number: u64,
    pub timestamp: u64,
    pub base_fee: u128,
}

/// A pending transaction fetched after a `newPendingTransactions` hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Signed RLP bytes when the node exposes them.
    pub raw: Option<Bytes>,
    pub first_seen_ms: i64,
}

/// A submitted bundle, persisted for audit. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRecord {
    pub bundle_hash: String,
    pub cycle_id: String,
    pub target_blocks: Vec<u64>,
    pub signed_transactions: Vec<String>,
    pub profit_wei: String,
    pub submitted_at: String,
}
