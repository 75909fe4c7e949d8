//! Ingestion health, degraded mode and bulk re-reads.
//!
//! [`Health`] aggregates the liveness of the three feeds, the latest block
//! header and whether a bulk re-read is outstanding. The supervisor reacts to
//! liveness changes: as soon as any feed drops it discards buffered pool
//! events (they cannot be trusted without a synchronized block context) and
//! schedules a bulk re-read; once every feed is live again it re-reads all
//! pool reserves over HTTP and lifts the submission gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use eyre::Result;
use indicatif::ProgressBar;
use tokio::sync::{mpsc, watch, Notify};

use crate::debounce::{self, SharedDebouncer};
use crate::mempool::PendingTxPool;
use crate::pools::PoolStore;
use crate::rpc::RpcClient;
use crate::types::{ChainHead, FeedKind, ReserveUpdate, RESYNC_SEQUENCE};

const RESYNC_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Shared view of ingestion health.
#[derive(Debug)]
pub struct Health {
    live: [AtomicBool; 3],
    resync_pending: AtomicBool,
    resync_scheduled: AtomicBool,
    changed: Notify,
    head: watch::Sender<ChainHead>,
    block_time_secs: u64,
    late_threshold_secs: u64,
}

impl Health {
    /// A fresh health starts with every feed down and a re-read pending.
    pub fn new(block_time_secs: u64, late_threshold_secs: u64) -> Self {
        let (head, _) = watch::channel(ChainHead::default());
        Self {
            live: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
            resync_pending: AtomicBool::new(true),
            resync_scheduled: AtomicBool::new(false),
            changed: Notify::new(),
            head,
            block_time_secs,
            late_threshold_secs,
        }
    }

    pub fn set_live(&self, feed: FeedKind, live: bool) {
        let previous = self.live[feed.index()].swap(live, Ordering::AcqRel);
        if previous != live {
            self.changed.notify_one();
        }
    }

    pub fn is_live(&self, feed: FeedKind) -> bool {
        self.live[feed.index()].load(Ordering::Acquire)
    }

    pub fn all_live(&self) -> bool {
        FeedKind::ALL.iter().all(|feed| self.is_live(*feed))
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending.load(Ordering::Acquire)
    }

    pub fn set_resync_pending(&self, pending: bool) {
        self.resync_pending.store(pending, Ordering::Release);
        self.changed.notify_one();
    }

    /// Requests a routine re-read that does not gate submissions.
    pub fn schedule_resync(&self) {
        self.resync_scheduled.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    fn take_scheduled_resync(&self) -> bool {
        self.resync_scheduled.swap(false, Ordering::AcqRel)
    }

    pub fn record_head(&self, head: ChainHead) {
        self.head.send_if_modified(|current| {
            if head.number > current.number {
                *current = head;
                true
            } else {
                false
            }
        });
    }

    pub fn head(&self) -> ChainHead {
        *self.head.borrow()
    }

    /// Receiver that wakes on every new block header.
    pub fn subscribe_heads(&self) -> watch::Receiver<ChainHead> {
        self.head.subscribe()
    }

    /// Whether the last block is overdue by more than the late threshold.
    pub fn block_is_late(&self, now_secs: u64) -> bool {
        let head = self.head();
        head.timestamp > 0
            && now_secs > head.timestamp + self.block_time_secs + self.late_threshold_secs
    }

    /// Degraded mode: any feed down or a bulk re-read outstanding.
    pub fn degraded(&self) -> bool {
        !self.all_live() || self.resync_pending()
    }

    pub fn submissions_allowed(&self, now_secs: u64) -> bool {
        !self.degraded() && !self.block_is_late(now_secs)
    }

    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Re-reads every registered pool at one block and applies the result.
///
/// # Errors
/// Returns error if the block number or a batch of `getReserves` calls fails.
#[tracing::instrument(skip_all, fields(pools = store.len()))]
pub async fn bulk_resync(
    rpc: &RpcClient,
    store: &PoolStore,
    chunk: usize,
    progress: &ProgressBar,
) -> Result<usize> {
    let block = rpc.block_number().await?;
    let generation = store.current_generation_for(FeedKind::PoolEvents);
    let addresses = store.pool_addresses();
    progress.set_length(addresses.len() as u64);

    let mut updates = Vec::with_capacity(addresses.len());
    for slice in addresses.chunks(chunk.max(1)) {
        let reserves = rpc.get_reserves(slice, block, slice.len()).await?;
        updates.extend(reserves.into_iter().map(|reserves| ReserveUpdate {
            pool: reserves.pool,
            reserve_a: reserves.reserve0,
            reserve_b: reserves.reserve1,
            block,
            sequence: RESYNC_SEQUENCE,
            generation,
        }));
        progress.inc(slice.len() as u64);
    }

    let applied = store.apply_batch(&updates);
    store.mark_all_dirty();
    progress.finish_and_clear();

    tracing::info!(block, read = updates.len(), applied, "bulk reserve re-read complete");
    Ok(applied)
}

/// Drives degraded-mode entry/exit and scheduled re-reads until shutdown.
pub async fn run_supervisor(
    health: Arc<Health>,
    store: Arc<PoolStore>,
    debouncer: SharedDebouncer,
    rpc: Arc<RpcClient>,
    chunk: usize,
    optimizer: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut degraded_logged = false;

    loop {
        if !health.all_live() {
            if !degraded_logged {
                let dropped = debounce::lock(&debouncer).discard();
                health.set_resync_pending(true);
                let down: Vec<&str> = FeedKind::ALL
                    .iter()
                    .filter(|feed| !health.is_live(**feed))
                    .map(|feed| feed.as_str())
                    .collect();
                tracing::warn!(?down, dropped, "entering degraded mode; submissions suspended");
                degraded_logged = true;
            } else {
                // The drain task drops ready batches itself; this clears the rest.
                debounce::lock(&debouncer).discard();
            }
        } else if health.resync_pending() || health.take_scheduled_resync() {
            let gating = health.resync_pending();
            match bulk_resync(&rpc, &store, chunk, &ProgressBar::hidden()).await {
                Ok(_) => {
                    optimizer.notify_one();
                    if gating {
                        health.set_resync_pending(false);
                        tracing::info!("degraded mode cleared; submissions resumed");
                    }
                    degraded_logged = false;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "bulk re-read failed; retrying");
                    if !gating {
                        health.schedule_resync();
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RESYNC_RETRY_DELAY) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            continue;
        }

        tokio::select! {
            _ = health.changed() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("supervisor stopping");
                    return;
                }
            }
        }
    }
}

/// Consumes block headers: advances the clock, schedules periodic re-reads
/// and resolves pending transactions that were included or aged out.
///
/// Resolved hashes are forwarded on `resolved` so speculative results tied
/// to them can be discarded.
#[allow(clippy::too_many_arguments)]
pub async fn run_block_handler(
    mut heads: mpsc::Receiver<ChainHead>,
    health: Arc<Health>,
    rpc: Arc<RpcClient>,
    pending: Arc<PendingTxPool>,
    resync_interval_blocks: u64,
    resolved: mpsc::Sender<Vec<B256>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let head = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            head = heads.recv() => match head {
                Some(head) => head,
                None => return,
            },
        };

        health.record_head(head);
        tracing::debug!(block = head.number, base_fee = head.base_fee, "new block");

        if resync_interval_blocks > 0 && head.number % resync_interval_blocks == 0 {
            health.schedule_resync();
        }

        let mut done = pending.expire(chrono::Utc::now().timestamp_millis());
        if !pending.is_empty() {
            match rpc.block_with_hashes(head.number).await {
                Ok(Some((_, hashes))) => done.extend(pending.finalize(&hashes)),
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(block = head.number, error = %error, "failed to fetch block transactions");
                }
            }
        }

        if !done.is_empty() && resolved.send(done).await.is_err() {
            return;
        }
    }
}
