//! Pending transaction tracking.
//!
//! Hashes from the `newPendingTransactions` feed are looked up over HTTP,
//! filtered down to the configured router contracts and recorded in a
//! [`PendingTxPool`]. A record lives until its hash shows up in a block or it
//! exceeds the configured age, whichever comes first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::rpc::RpcClient;
use crate::types::PendingTransaction;

const MAX_CONCURRENT_LOOKUPS: usize = 16;

/// Concurrent map of pending transactions keyed by hash.
#[derive(Debug)]
pub struct PendingTxPool {
    entries: DashMap<B256, PendingTransaction>,
    max_age: Duration,
}

impl PendingTxPool {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
        }
    }

    /// Records `tx` on first sight. Returns `false` for duplicates.
    pub fn observe(&self, tx: PendingTransaction) -> bool {
        match self.entries.entry(tx.hash) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &B256) -> Option<PendingTransaction> {
        self.entries.get(hash).map(|entry| entry.value().clone())
    }

    /// Removes every tracked hash included in a block, returning them.
    pub fn finalize(&self, included: &[B256]) -> Vec<B256> {
        included
            .iter()
            .filter(|hash| self.entries.remove(*hash).is_some())
            .copied()
            .collect()
    }

    /// Removes records first seen more than `max_age` before `now_ms`.
    pub fn expire(&self, now_ms: i64) -> Vec<B256> {
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let stale: Vec<B256> = self
            .entries
            .iter()
            .filter(|entry| entry.value().first_seen_ms < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for hash in &stale {
            self.entries.remove(hash);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves pending hashes into transactions addressed to `routers`.
///
/// Lookups run concurrently; transactions to other contracts, already-seen
/// hashes and failed lookups are dropped.
pub async fn run_pending_lookup(
    mut hashes: mpsc::Receiver<B256>,
    rpc: Arc<RpcClient>,
    pool: Arc<PendingTxPool>,
    routers: HashSet<Address>,
    out: mpsc::Sender<PendingTransaction>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_LOOKUPS));
    let routers = Arc::new(routers);

    loop {
        let hash = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            hash = hashes.recv() => match hash {
                Some(hash) => hash,
                None => return,
            },
        };

        if pool.contains(&hash) {
            continue;
        }
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };

        let rpc = rpc.clone();
        let pool = pool.clone();
        let routers = routers.clone();
        let out = out.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let tx = match rpc.transaction_by_hash(hash).await {
                Ok(Some(tx)) => tx,
                Ok(None) => return,
                Err(error) => {
                    tracing::trace!(%hash, error = %error, "pending lookup failed");
                    return;
                }
            };
            if !tx.to.is_some_and(|to| routers.contains(&to)) {
                return;
            }

            let raw = rpc.raw_transaction_by_hash(hash).await.ok().flatten();
            let tx = PendingTransaction { raw, ..tx };
            if pool.observe(tx.clone()) {
                tracing::debug!(%hash, router = ?tx.to, "tracking pending router transaction");
                let _ = out.send(tx).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, U256};

    fn pending(byte: u8, first_seen_ms: i64) -> PendingTransaction {
        PendingTransaction {
            hash: B256::repeat_byte(byte),
            from: Address::ZERO,
            to: None,
            input: Bytes::new(),
            value: U256::ZERO,
            nonce: 0,
            gas_limit: 21_000,
            gas_price: None,
            max_fee_per_gas: Some(30_000_000_000),
            max_priority_fee_per_gas: Some(1_000_000_000),
            raw: None,
            first_seen_ms,
        }
    }

    #[test]
    fn duplicate_observations_are_ignored() {
        let pool = PendingTxPool::new(Duration::from_secs(36));
        assert!(pool.observe(pending(1, 0)));
        assert!(!pool.observe(pending(1, 5)));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&B256::repeat_byte(1)).expect("tracked").first_seen_ms, 0);
    }

    #[test]
    fn finalize_removes_included_hashes() {
        let pool = PendingTxPool::new(Duration::from_secs(36));
        pool.observe(pending(1, 0));
        pool.observe(pending(2, 0));

        let removed = pool.finalize(&[B256::repeat_byte(2), B256::repeat_byte(9)]);
        assert_eq!(removed, vec![B256::repeat_byte(2)]);
        assert!(pool.contains(&B256::repeat_byte(1)));
        assert!(!pool.contains(&B256::repeat_byte(2)));
    }

    #[test]
    fn expire_drops_old_records() {
        let pool = PendingTxPool::new(Duration::from_secs(36));
        pool.observe(pending(1, 1_000));
        pool.observe(pending(2, 30_000));

        let expired = pool.expire(40_000);
        assert_eq!(expired, vec![B256::repeat_byte(1)]);
        assert_eq!(pool.len(), 1);
    }
}
