//! Debounced batching of pool-event records.
//!
//! Records are buffered in arrival order. A batch is ready once the feed has
//! been quiet for the quiescence window, or once the oldest buffered record
//! has waited longer than the hard cap. Draining keeps only the newest record
//! per pool: later records supersede earlier ones, they are never summed or
//! replayed.
//!
//! [`Debouncer`] is clock-agnostic (callers pass `now`) so the timing rules
//! are testable without sleeping; [`run_drain`] drives it from a tokio task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::pipeline::Health;
use crate::pools::PoolStore;
use crate::types::{FeedKind, ReserveUpdate};

#[derive(Debug, Clone, Copy)]
struct Buffered {
    update: ReserveUpdate,
    arrival: Instant,
}

/// Time-ordered buffer of reserve updates with quiet-window draining.
#[derive(Debug)]
pub struct Debouncer {
    quiescence: Duration,
    max_delay: Duration,
    buffer: Vec<Buffered>,
}

impl Debouncer {
    pub fn new(quiescence: Duration, max_delay: Duration) -> Self {
        Self {
            quiescence,
            max_delay,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, update: ReserveUpdate, now: Instant) {
        self.buffer.push(Buffered {
            update,
            arrival: now,
        });
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Instant at which the buffer becomes ready, if anything is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        let oldest = self.buffer.first()?.arrival;
        let newest = self.buffer.last()?.arrival;
        Some((newest + self.quiescence).min(oldest + self.max_delay))
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Empties the buffer, returning the latest record for each pool.
    ///
    /// Output is ordered by pool address so batch application is deterministic.
    pub fn drain(&mut self) -> Vec<ReserveUpdate> {
        let mut latest: HashMap<Address, ReserveUpdate> = HashMap::new();
        for buffered in self.buffer.drain(..) {
            latest.insert(buffered.update.pool, buffered.update);
        }
        let mut batch: Vec<ReserveUpdate> = latest.into_values().collect();
        batch.sort_by_key(|update| update.pool);
        batch
    }

    /// Throws away everything buffered, returning how many records were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

/// Shared handle so degraded mode can discard the buffer from another task.
pub type SharedDebouncer = Arc<Mutex<Debouncer>>;

/// Drains debounced batches into the store until shutdown.
///
/// Updates from a superseded pool-event connection are filtered out before
/// the batch is applied. While any feed is down a ready batch is discarded
/// instead. After each applied batch `optimizer` is notified.
pub async fn run_drain(
    debouncer: SharedDebouncer,
    mut updates: mpsc::Receiver<ReserveUpdate>,
    store: Arc<PoolStore>,
    health: Arc<Health>,
    optimizer: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let deadline = lock(&debouncer).next_deadline();
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("drain task stopping");
                    return;
                }
            }
            received = updates.recv() => {
                let Some(update) = received else {
                    tracing::debug!("pool event channel closed, drain task stopping");
                    return;
                };
                lock(&debouncer).push(update, Instant::now());
            }
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                let batch = {
                    let mut guard = lock(&debouncer);
                    if !guard.ready(Instant::now()) {
                        continue;
                    }
                    guard.drain()
                };
                flush(&batch, &store, &health, &optimizer);
            }
        }
    }
}

fn flush(batch: &[ReserveUpdate], store: &PoolStore, health: &Health, optimizer: &Notify) {
    if !health.all_live() {
        tracing::debug!(dropped = batch.len(), "feed down, discarding debounced batch");
        return;
    }

    let generation = store.current_generation_for(FeedKind::PoolEvents);
    let current: Vec<ReserveUpdate> = batch
        .iter()
        .filter(|update| update.generation >= generation)
        .copied()
        .collect();

    let applied = store.apply_batch(&current);
    tracing::debug!(
        drained = batch.len(),
        superseded = batch.len() - current.len(),
        applied,
        "applied debounced batch"
    );
    if applied > 0 {
        optimizer.notify_one();
    }
}

pub(crate) fn lock(debouncer: &SharedDebouncer) -> std::sync::MutexGuard<'_, Debouncer> {
    debouncer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, U256};

    const POOL_1: Address = address!("0000000000000000000000000000000000000101");
    const POOL_2: Address = address!("0000000000000000000000000000000000000102");

    fn update(pool: Address, block: u64, sequence: u64, reserve: u64) -> ReserveUpdate {
        ReserveUpdate {
            pool,
            reserve_a: U256::from(reserve),
            reserve_b: U256::from(reserve * 2),
            block,
            sequence,
            generation: 0,
        }
    }

    fn live_health() -> Health {
        let health = Health::new(12, 6);
        for feed in FeedKind::ALL {
            health.set_live(feed, true);
        }
        health
    }

    fn debouncer() -> Debouncer {
        Debouncer::new(Duration::from_millis(75), Duration::from_millis(500))
    }

    #[test]
    fn coalesces_burst_to_last_record_per_pool() {
        let mut debouncer = debouncer();
        let start = Instant::now();
        for i in 0..50u64 {
            debouncer.push(update(POOL_1, 100, i, 1_000 + i), start + Duration::from_millis(i));
        }
        debouncer.push(update(POOL_2, 100, 7, 42), start + Duration::from_millis(10));

        let batch = debouncer.drain();
        assert_eq!(batch.len(), 2);
        let pool_1 = batch
            .iter()
            .find(|u| u.pool == POOL_1)
            .expect("pool 1 should be in batch");
        assert_eq!(pool_1.reserve_a, U256::from(1_049u64));
        assert_eq!(pool_1.sequence, 49);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn waits_for_quiet_window() {
        let mut debouncer = debouncer();
        let start = Instant::now();
        debouncer.push(update(POOL_1, 1, 0, 1), start);
        debouncer.push(update(POOL_1, 1, 1, 2), start + Duration::from_millis(50));

        assert!(!debouncer.ready(start + Duration::from_millis(100)));
        assert!(debouncer.ready(start + Duration::from_millis(125)));
    }

    #[test]
    fn hard_cap_fires_during_continuous_burst() {
        let mut debouncer = debouncer();
        let start = Instant::now();
        for i in 0..20u64 {
            debouncer.push(update(POOL_1, 1, i, i), start + Duration::from_millis(i * 30));
        }
        // Never quiet for 75 ms, but the first record is 500 ms old.
        assert!(!debouncer.ready(start + Duration::from_millis(499)));
        assert!(debouncer.ready(start + Duration::from_millis(500)));
    }

    #[test]
    fn empty_buffer_is_never_ready() {
        let debouncer = debouncer();
        assert!(debouncer.next_deadline().is_none());
        assert!(!debouncer.ready(Instant::now() + Duration::from_secs(10)));
    }

    #[test]
    fn discard_drops_everything() {
        let mut debouncer = debouncer();
        let now = Instant::now();
        debouncer.push(update(POOL_1, 1, 0, 1), now);
        debouncer.push(update(POOL_2, 1, 1, 1), now);
        assert_eq!(debouncer.discard(), 2);
        assert!(debouncer.drain().is_empty());
    }

    #[test]
    fn flush_skips_superseded_generation() {
        use crate::registry::CycleDefinition;
        use crate::types::PoolSnapshot;

        let token_a = address!("00000000000000000000000000000000000000aa");
        let token_b = address!("00000000000000000000000000000000000000bb");
        let store = PoolStore::new(
            vec![
                PoolSnapshot::new(POOL_1, token_a, token_b),
                PoolSnapshot::new(POOL_2, token_a, token_b),
            ],
            &Vec::<CycleDefinition>::new(),
        );
        let generation = store.begin_generation(FeedKind::PoolEvents);
        let notify = Notify::new();

        let mut fresh = update(POOL_2, 1, 0, 9);
        fresh.generation = generation;
        flush(&[update(POOL_1, 1, 0, 5), fresh], &store, &live_health(), &notify);

        assert!(store.snapshot(POOL_1).expect("pool 1").reserve_a.is_zero());
        assert_eq!(store.snapshot(POOL_2).expect("pool 2").reserve_a, U256::from(9u64));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_task_applies_one_batch_for_burst() {
        use crate::registry::CycleDefinition;
        use crate::types::PoolSnapshot;

        let token_a = address!("00000000000000000000000000000000000000aa");
        let token_b = address!("00000000000000000000000000000000000000bb");
        let cycle = CycleDefinition {
            id: "c".to_string(),
            borrow_pool: POOL_1,
            swap_pools: vec![POOL_2],
            borrow_token: token_a,
            repay_token: token_b,
            token_path: vec![token_a, token_b],
        };
        let store = Arc::new(PoolStore::new(
            vec![
                PoolSnapshot::new(POOL_1, token_a, token_b),
                PoolSnapshot::new(POOL_2, token_a, token_b),
            ],
            std::slice::from_ref(&cycle),
        ));
        store.take_dirty();

        let shared = Arc::new(Mutex::new(debouncer()));
        let notify = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_drain(
            shared.clone(),
            rx,
            store.clone(),
            Arc::new(live_health()),
            notify.clone(),
            shutdown_rx,
        ));

        for i in 0..50u64 {
            tx.send(update(POOL_1, 10, i, 100 + i))
                .await
                .expect("drain task should be receiving");
        }
        notify.notified().await;

        let snapshot = store.snapshot(POOL_1).expect("pool 1 should exist");
        assert_eq!(snapshot.reserve_a, U256::from(149u64));
        assert_eq!(snapshot.last_update_sequence, 49);
        assert_eq!(store.take_dirty(), vec![0]);
        assert!(lock(&shared).is_empty());

        drop(tx);
        task.await.expect("drain task should exit cleanly");
    }

    #[test]
    fn flush_discards_while_a_feed_is_down() {
        use crate::registry::CycleDefinition;
        use crate::types::PoolSnapshot;

        let token_a = address!("00000000000000000000000000000000000000aa");
        let token_b = address!("00000000000000000000000000000000000000bb");
        let store = PoolStore::new(
            vec![PoolSnapshot::new(POOL_1, token_a, token_b)],
            &Vec::<CycleDefinition>::new(),
        );
        let health = live_health();
        health.set_live(FeedKind::PendingTransactions, false);
        let notify = Notify::new();

        flush(&[update(POOL_1, 1, 0, 5)], &store, &health, &notify);
        assert!(store.snapshot(POOL_1).expect("pool 1").reserve_a.is_zero());
    }
}
