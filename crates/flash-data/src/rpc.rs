//! HTTP JSON-RPC client for the handful of node calls the engine needs.
//!
//! Calls are plain `reqwest` POSTs with typed response envelopes. Bulk
//! reserve reads go out as JSON-RPC batches of `eth_call getReserves()`
//! pinned to a single block so the resulting snapshot is consistent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::sol;
use alloy::sol_types::SolCall;
use eyre::{eyre, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::types::{ChainHead, PendingTransaction};

sol! {
    interface IUniswapV2Pair {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[serde(default)]
    id: Option<u64>,
    result: Option<T>,
    error: Option<RpcError>,
}

/// Header fields shared by `eth_getBlockByNumber` and `newHeads`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub number: U64,
    pub timestamp: U64,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
}

impl RawHeader {
    pub fn to_head(&self) -> ChainHead {
        ChainHead {
            number: self.number.to::<u64>(),
            timestamp: self.timestamp.to::<u64>(),
            base_fee: self
                .base_fee_per_gas
                .map(|fee| fee.saturating_to::<u128>())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    #[serde(flatten)]
    header: RawHeader,
    #[serde(default)]
    transactions: Vec<B256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    input: Bytes,
    value: U256,
    nonce: U64,
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    status: Option<U64>,
    block_number: Option<U64>,
}

/// Inclusion outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: u64,
}

/// Reserves returned by a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReserves {
    pub pool: Address,
    pub reserve0: U256,
    pub reserve1: U256,
}

/// JSON-RPC over HTTP.
#[derive(Debug)]
pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .wrap_err("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method`, returning `None` when the node answers `null`.
    ///
    /// # Errors
    /// Returns error on transport failure, non-2xx status or an RPC error object.
    pub async fn request_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .wrap_err_with(|| format!("{method} request failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(eyre!("{} returned HTTP status {}", method, status));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .wrap_err_with(|| format!("failed decoding {method} response"))?;

        if let Some(error) = body.error {
            return Err(eyre!("{} RPC error {}: {}", method, error.code, error.message));
        }
        Ok(body.result)
    }

    /// Like [`Self::request_optional`] but treats `null` as an error.
    ///
    /// # Errors
    /// Returns error on any failure or an empty result.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| eyre!("{} returned no result", method))
    }

    /// Sends one JSON-RPC batch of the same method. Results keep input order;
    /// per-entry errors become `None`.
    ///
    /// # Errors
    /// Returns error if the batch itself fails.
    pub async fn batch<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Option<T>>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let base = self.next_id.fetch_add(params.len() as u64, Ordering::Relaxed);
        let payload: Vec<Value> = params
            .into_iter()
            .enumerate()
            .map(|(offset, params)| {
                json!({
                    "jsonrpc": "2.0",
                    "id": base + offset as u64,
                    "method": method,
                    "params": params,
                })
            })
            .collect();
        let count = payload.len();

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .wrap_err_with(|| format!("{method} batch request failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(eyre!("{} batch returned HTTP status {}", method, status));
        }

        let bodies: Vec<RpcResponse<T>> = response
            .json()
            .await
            .wrap_err_with(|| format!("failed decoding {method} batch response"))?;

        let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
        for body in bodies {
            let Some(slot) = body
                .id
                .and_then(|id| id.checked_sub(base))
                .and_then(|offset| usize::try_from(offset).ok())
                .filter(|offset| *offset < count)
            else {
                continue;
            };
            if let Some(error) = body.error {
                tracing::debug!(method, code = error.code, message = %error.message, "batch entry failed");
                continue;
            }
            results[slot] = body.result;
        }
        Ok(results)
    }

    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn block_number(&self) -> Result<u64> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.to::<u64>())
    }

    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    /// Pending-inclusive nonce of `account`.
    ///
    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn transaction_count(&self, account: Address) -> Result<u64> {
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                json!([format!("{account:#x}"), "pending"]),
            )
            .await?;
        Ok(nonce.to::<u64>())
    }

    /// Reads `getReserves()` for every pool at `block`, in batches of `chunk`.
    ///
    /// Pools whose call fails or returns malformed data are skipped.
    ///
    /// # Errors
    /// Returns error only if a whole batch fails.
    #[tracing::instrument(skip_all, fields(pools = pools.len(), block = block))]
    pub async fn get_reserves(
        &self,
        pools: &[Address],
        block: u64,
        chunk: usize,
    ) -> Result<Vec<PoolReserves>> {
        let call_data = Bytes::from(IUniswapV2Pair::getReservesCall {}.abi_encode());
        let block_tag = format!("0x{block:x}");
        let mut reserves = Vec::with_capacity(pools.len());

        for slice in pools.chunks(chunk.max(1)) {
            let params: Vec<Value> = slice
                .iter()
                .map(|pool| {
                    json!([
                        { "to": format!("{pool:#x}"), "data": call_data.to_string() },
                        block_tag,
                    ])
                })
                .collect();

            let outputs: Vec<Option<Bytes>> = self.batch("eth_call", params).await?;
            for (pool, output) in slice.iter().zip(outputs) {
                let Some(output) = output else {
                    tracing::debug!(pool = %pool, "getReserves call failed; skipping");
                    continue;
                };
                match IUniswapV2Pair::getReservesCall::abi_decode_returns(&output, true) {
                    Ok(decoded) => reserves.push(PoolReserves {
                        pool: *pool,
                        reserve0: U256::from(decoded.reserve0.to::<u128>()),
                        reserve1: U256::from(decoded.reserve1.to::<u128>()),
                    }),
                    Err(error) => {
                        tracing::debug!(pool = %pool, error = %error, "failed to decode getReserves output; skipping");
                    }
                }
            }
        }

        Ok(reserves)
    }

    /// # Errors
    /// Returns error if the RPC call fails or the payload is malformed.
    pub async fn transaction_by_hash(&self, hash: B256) -> Result<Option<PendingTransaction>> {
        let raw: Option<RawTransaction> = self
            .request_optional("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(raw.map(|tx| PendingTransaction {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            input: tx.input,
            value: tx.value,
            nonce: tx.nonce.to::<u64>(),
            gas_limit: tx.gas.to::<u64>(),
            gas_price: tx.gas_price.map(|v| v.saturating_to::<u128>()),
            max_fee_per_gas: tx.max_fee_per_gas.map(|v| v.saturating_to::<u128>()),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(|v| v.saturating_to::<u128>()),
            raw: None,
            first_seen_ms: chrono::Utc::now().timestamp_millis(),
        }))
    }

    /// Signed bytes of a pending transaction (Geth/Erigon extension).
    ///
    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn raw_transaction_by_hash(&self, hash: B256) -> Result<Option<Bytes>> {
        self.request_optional("eth_getRawTransactionByHash", json!([hash]))
            .await
    }

    /// Header and transaction hashes of block `number`.
    ///
    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn block_with_hashes(&self, number: u64) -> Result<Option<(ChainHead, Vec<B256>)>> {
        let block: Option<RawBlock> = self
            .request_optional(
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), false]),
            )
            .await?;
        Ok(block.map(|block| (block.header.to_head(), block.transactions)))
    }

    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn latest_head(&self) -> Result<ChainHead> {
        let header: RawHeader = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        Ok(header.to_head())
    }

    /// # Errors
    /// Returns error if the RPC call fails.
    pub async fn receipt_status(&self, hash: B256) -> Result<Option<ReceiptStatus>> {
        let receipt: Option<RawReceipt> = self
            .request_optional("eth_getTransactionReceipt", json!([hash]))
            .await?;
        Ok(receipt.and_then(|receipt| {
            Some(ReceiptStatus {
                success: receipt.status?.to::<u64>() == 1,
                block_number: receipt.block_number?.to::<u64>(),
            })
        }))
    }
}

/// Decodes the two packed words of a `Sync(uint112,uint112)` log payload.
///
/// # Errors
/// Returns error if the payload is shorter than two words or not hex.
pub fn decode_sync_data(data: &str) -> Result<(U256, U256)> {
    let trimmed = data.trim_start_matches("0x");
    if trimmed.len() < 128 {
        return Err(eyre!("sync data payload too short: {}", data));
    }
    let reserve0 = U256::from_str_radix(&trimmed[0..64], 16)
        .map_err(|error| eyre!("invalid reserve0 word: {}", error))?;
    let reserve1 = U256::from_str_radix(&trimmed[64..128], 16)
        .map_err(|error| eyre!("invalid reserve1 word: {}", error))?;
    Ok((reserve0, reserve1))
}

/// Parses a `0x`-prefixed hex quantity.
///
/// # Errors
/// Returns error if the value is not valid hex.
pub fn parse_hex_u64(value: &str) -> Result<u64> {
    let trimmed = value.trim_start_matches("0x");
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 16)
        .map_err(|error| eyre!("failed to parse hex u64 '{}': {}", value, error))
}
