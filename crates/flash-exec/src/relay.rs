//! Bundle relay client.
//!
//! Bundles are simulated with `eth_callBundle` and submitted with
//! `eth_sendBundle`. Every request body is signed by an identity key and
//! the signature travels in the `X-Flashbots-Signature` header.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{hex, keccak256, Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

const SIGNATURE_HEADER: &str = "X-Flashbots-Signature";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("relay returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("relay response missing result")]
    EmptyResponse,
    #[error("malformed relay response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to sign relay request: {0}")]
    Signing(String),
}

/// Per-transaction outcome of a bundle simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxSimulation {
    pub tx_hash: B256,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub revert: Option<String>,
    #[serde(default, rename = "fromAddress")]
    pub from: Option<Address>,
}

/// Result of `eth_callBundle`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    #[serde(default)]
    pub bundle_hash: Option<B256>,
    #[serde(default)]
    pub results: Vec<TxSimulation>,
    #[serde(default)]
    pub total_gas_used: u64,
}

impl SimulationReport {
    /// First error or revert reason reported for any transaction.
    pub fn first_error(&self) -> Option<&str> {
        self.results
            .iter()
            .find_map(|tx| tx.error.as_deref().or(tx.revert.as_deref()))
    }

    /// Gas used by transactions sent from `account`.
    pub fn gas_used_by(&self, account: Address) -> u64 {
        self.results
            .iter()
            .filter(|tx| tx.from == Some(account))
            .map(|tx| tx.gas_used)
            .sum()
    }
}

/// Bundle simulation and submission.
#[async_trait]
pub trait BundleRelay: Send + Sync {
    /// Simulates `txs` as if included in `block` on top of the latest state.
    async fn simulate(&self, txs: &[Bytes], block: u64) -> Result<SimulationReport, RelayError>;

    /// Submits `txs` for inclusion in `block`, returning the bundle hash.
    async fn send(&self, txs: &[Bytes], block: u64) -> Result<B256, RelayError>;
}

/// Signs relay request bodies.
#[derive(Debug, Clone)]
pub struct RelayIdentity {
    signer: PrivateKeySigner,
}

impl RelayIdentity {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// `{address}:{signature}` over the hex keccak of `body`.
    ///
    /// # Errors
    /// Returns [`RelayError::Signing`] if the signer fails.
    pub fn header_value(&self, body: &[u8]) -> Result<String, RelayError> {
        let digest = format!("{:#x}", keccak256(body));
        let signature = self
            .signer
            .sign_message_sync(digest.as_bytes())
            .map_err(|error| RelayError::Signing(error.to_string()))?;
        Ok(format!(
            "{:#x}:{}",
            self.address(),
            hex::encode_prefixed(signature.as_bytes())
        ))
    }
}

#[derive(Debug, Deserialize)]
struct RelayRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RelayResponse<T> {
    result: Option<T>,
    error: Option<RelayRpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBundleResult {
    bundle_hash: B256,
}

/// Flashbots-compatible relay over HTTP.
#[derive(Debug)]
pub struct FlashbotsRelay {
    client: Client,
    url: String,
    identity: RelayIdentity,
    next_id: AtomicU64,
}

impl FlashbotsRelay {
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(url: &str, identity: RelayIdentity) -> Result<Self, RelayError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            identity,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RelayError> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": [params],
        }))?;
        let signature = self.identity.header_value(&body)?;

        let response: RelayResponse<T> = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(RelayError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or(RelayError::EmptyResponse)
    }
}

fn encode_txs(txs: &[Bytes]) -> Vec<String> {
    txs.iter().map(hex::encode_prefixed).collect()
}

#[async_trait]
impl BundleRelay for FlashbotsRelay {
    #[tracing::instrument(skip_all, fields(block = block, txs = txs.len()))]
    async fn simulate(&self, txs: &[Bytes], block: u64) -> Result<SimulationReport, RelayError> {
        let report: SimulationReport = self
            .call(
                "eth_callBundle",
                json!({
                    "txs": encode_txs(txs),
                    "blockNumber": format!("{block:#x}"),
                    "stateBlockNumber": "latest",
                }),
            )
            .await?;
        debug!(gas = report.total_gas_used, "bundle simulated");
        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(block = block, txs = txs.len()))]
    async fn send(&self, txs: &[Bytes], block: u64) -> Result<B256, RelayError> {
        let result: SendBundleResult = self
            .call(
                "eth_sendBundle",
                json!({
                    "txs": encode_txs(txs),
                    "blockNumber": format!("{block:#x}"),
                }),
            )
            .await?;
        Ok(result.bundle_hash)
    }
}

/// Runs `op` up to `attempts` times, sleeping `delay` between failures.
///
/// # Errors
/// Returns the last error once every attempt has failed.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts => {
                warn!(attempt, error = %error, "relay call failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::PrimitiveSignature;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn header_signature_recovers_identity() {
        let identity = RelayIdentity::new(PrivateKeySigner::random());
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"eth_callBundle","params":[]}"#;
        let header = identity.header_value(body).expect("should sign body");

        let (address, signature) = header.split_once(':').expect("address:signature");
        assert_eq!(address, format!("{:#x}", identity.address()));

        let bytes = hex::decode(signature).expect("hex signature");
        assert_eq!(bytes.len(), 65);
        let signature = PrimitiveSignature::try_from(bytes.as_slice()).expect("valid signature");
        let digest = format!("{:#x}", keccak256(body));
        let recovered = signature
            .recover_address_from_msg(digest.as_bytes())
            .expect("recoverable");
        assert_eq!(recovered, identity.address());
    }

    #[test]
    fn parses_call_bundle_result() {
        let ours = Address::repeat_byte(0xaa);
        let report: SimulationReport = serde_json::from_value(json!({
            "bundleHash": format!("{:#x}", B256::repeat_byte(9)),
            "totalGasUsed": 231_000,
            "results": [
                {
                    "txHash": format!("{:#x}", B256::repeat_byte(1)),
                    "gasUsed": 21_000,
                    "fromAddress": format!("{:#x}", Address::repeat_byte(0xbb)),
                },
                {
                    "txHash": format!("{:#x}", B256::repeat_byte(2)),
                    "gasUsed": 210_000,
                    "fromAddress": format!("{:#x}", ours),
                }
            ]
        }))
        .expect("report should parse");

        assert_eq!(report.bundle_hash, Some(B256::repeat_byte(9)));
        assert_eq!(report.first_error(), None);
        assert_eq!(report.gas_used_by(ours), 210_000);
    }

    #[test]
    fn reverted_transaction_is_reported() {
        let report: SimulationReport = serde_json::from_value(json!({
            "results": [
                { "txHash": format!("{:#x}", B256::ZERO), "gasUsed": 50_000, "revert": "UniswapV2: K" },
                { "txHash": format!("{:#x}", B256::ZERO), "error": "execution reverted" }
            ]
        }))
        .expect("report should parse");
        assert_eq!(report.first_error(), Some("UniswapV2: K"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let value = with_retries(3, Duration::from_millis(100), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RelayError::EmptyResponse)
            } else {
                Ok(7)
            }
        })
        .await
        .expect("third attempt should succeed");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(2, Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Rpc {
                code: -32000,
                message: "bundle rejected".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(RelayError::Rpc { code: -32000, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
