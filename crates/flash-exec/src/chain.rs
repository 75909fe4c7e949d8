//! Read-only chain access used by the bundler and the blacklist sweeper.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Result;
use flash_data::rpc::{PoolReserves, ReceiptStatus, RpcClient};

/// Chain queries the execution side needs. Implemented over HTTP JSON-RPC;
/// tests substitute an in-memory chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// `getReserves()` of each pool at `block`. Pools whose call fails are omitted.
    async fn reserves_at(&self, pools: &[Address], block: u64) -> Result<Vec<PoolReserves>>;

    /// Next nonce for `account`, counting pending transactions.
    async fn pending_nonce(&self, account: Address) -> Result<u64>;

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptStatus>>;
}

#[async_trait]
impl ChainReader for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        RpcClient::block_number(self).await
    }

    async fn reserves_at(&self, pools: &[Address], block: u64) -> Result<Vec<PoolReserves>> {
        self.get_reserves(pools, block, pools.len().max(1)).await
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64> {
        self.transaction_count(account).await
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptStatus>> {
        self.receipt_status(hash).await
    }
}
