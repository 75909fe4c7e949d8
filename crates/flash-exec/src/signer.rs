//! Transaction signing and nonce assignment.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{keccak256, Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use tokio::sync::Mutex;

use crate::chain::ChainReader;
use crate::gas::GasParams;

/// Unsigned executor transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
    pub gas: GasParams,
}

/// EIP-2718 encoded signed transaction and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

/// Signs executor transactions.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, request: &TxRequest) -> Result<SignedTransaction>;
}

/// Signer backed by an in-process private key.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    signer: PrivateKeySigner,
}

impl LocalSigner {
    /// # Errors
    /// Returns error if `key` is not a valid hex private key.
    pub fn from_key(key: &str) -> Result<Self> {
        let signer = key
            .trim()
            .parse::<PrivateKeySigner>()
            .wrap_err("invalid signer private key")?;
        Ok(Self { signer })
    }

    pub fn random() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign(&self, request: &TxRequest) -> Result<SignedTransaction> {
        let mut tx = TxEip1559 {
            chain_id: request.chain_id,
            nonce: request.nonce,
            gas_limit: request.gas.gas_limit,
            max_fee_per_gas: request.gas.max_fee_per_gas,
            max_priority_fee_per_gas: request.gas.max_priority_fee_per_gas,
            to: TxKind::Call(request.to),
            value: request.value,
            access_list: Default::default(),
            input: request.input.clone(),
        };
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|error| eyre!("failed to sign transaction: {error}"))?;
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        let raw = Bytes::from(envelope.encoded_2718());
        let hash = keccak256(&raw);
        Ok(SignedTransaction { raw, hash })
    }
}

/// Hands out sequential nonces to concurrent attempts.
///
/// The first reservation after [`NonceManager::invalidate`] re-reads the
/// pending nonce from chain.
#[derive(Debug, Default)]
pub struct NonceManager {
    next: Mutex<Option<u64>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns error if the nonce has to be fetched and the call fails.
    pub async fn reserve(&self, chain: &dyn ChainReader, account: Address) -> Result<u64> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => chain
                .pending_nonce(account)
                .await
                .wrap_err("failed to read account nonce")?,
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Hands `nonce` back if it is still the most recent reservation.
    ///
    /// A nonce with later reservations stacked on it stays consumed.
    pub async fn release(&self, nonce: u64) {
        let mut next = self.next.lock().await;
        if *next == Some(nonce + 1) {
            *next = Some(nonce);
        }
    }

    /// Forgets the local counter so the next reservation re-syncs from chain.
    pub async fn invalidate(&self) {
        *self.next.lock().await = None;
    }
}
