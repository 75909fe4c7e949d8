//! Task wiring for the long-running engine and the one-shot scan.
//!
//! Every task selects on the same `watch<bool>` shutdown signal. Setting it
//! (Ctrl-C in the CLI, or a confirmed trade in single-shot mode) stops new
//! work; attempts already in flight run to completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Context, Result};
use flash_data::debounce::{run_drain, Debouncer};
use flash_data::feeds::{self, FeedConfig};
use flash_data::mempool::{run_pending_lookup, PendingTxPool};
use flash_data::pipeline::{bulk_resync, run_block_handler, run_supervisor, Health};
use flash_data::rpc::RpcClient;
use flash_data::store::Store;
use flash_data::types::{ChainHead, FeedKind, PendingTransaction, ReserveUpdate};
use flash_data::{CycleDefinition, PoolStore, Registry};
use flash_sim::optimizer::{optimize_cycles, optimize_dirty, optimize_projection};
use flash_sim::projector::ProjectionError;
use flash_sim::{CycleBook, CycleOptimizer, MempoolProjector, OpportunityResult};
use indicatif::ProgressBar;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bundler::{run_bundler, run_sweeper, Bundler, BundlerConfig, Trigger};
use crate::gas::ProfitGate;
use crate::relay::{FlashbotsRelay, RelayIdentity};
use crate::signer::{LocalSigner, TransactionSigner};
use crate::tracker::CycleTracker;

const CHANNEL_CAPACITY: usize = 4_096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Endpoints, keys and run mode.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ws_url: String,
    pub rpc_url: String,
    pub relay_url: String,
    pub signer_key: String,
    /// Relay identity key. A throwaway key is generated when absent.
    pub identity_key: Option<String>,
    pub db_path: String,
    pub dry_run: bool,
    pub single_shot: bool,
}

/// Runs the engine until `shutdown` is set.
///
/// # Errors
/// Returns error on fatal startup problems: unreadable database, missing
/// executor address, bad keys or an unreachable node.
pub async fn run(
    mut registry: Registry,
    config: EngineConfig,
    shutdown: watch::Sender<bool>,
) -> Result<()> {
    let audit = Arc::new(Store::new(&config.db_path)?);
    let blacklisted = audit.blacklisted_ids()?;
    let removed = registry.remove_cycles(&blacklisted);
    if removed > 0 {
        info!(removed, "skipping blacklisted cycles");
    }
    if registry.cycles.is_empty() {
        return Err(eyre!("no cycles left to monitor"));
    }

    let settings = registry.settings.clone();
    let executor = settings
        .executor
        .ok_or_else(|| eyre!("settings.executor must be set to run the engine"))?;

    let rpc = Arc::new(RpcClient::new(&config.rpc_url)?);
    let chain_id = rpc.chain_id().await.wrap_err("failed to read chain id")?;

    let signer: Arc<dyn TransactionSigner> = Arc::new(LocalSigner::from_key(&config.signer_key)?);
    let identity = match &config.identity_key {
        Some(key) => key
            .trim()
            .parse::<PrivateKeySigner>()
            .wrap_err("invalid relay identity key")?,
        None => PrivateKeySigner::random(),
    };
    let relay = Arc::new(
        FlashbotsRelay::new(&config.relay_url, RelayIdentity::new(identity))
            .wrap_err("failed to build relay client")?,
    );

    let pools = Arc::new(PoolStore::new(registry.pools.clone(), &registry.cycles));
    let book = Arc::new(CycleBook::new(registry.cycles.clone()));
    let health = Arc::new(Health::new(
        settings.block_time_secs,
        settings.late_block_threshold_secs,
    ));
    let tracker = Arc::new(CycleTracker::load(&audit, &book)?);
    let projector = MempoolProjector::new(&registry);
    let optimizer = Arc::new(CycleOptimizer::default());

    info!(
        chain_id,
        pools = pools.len(),
        cycles = book.len(),
        signer = %signer.address(),
        %executor,
        dry_run = config.dry_run,
        single_shot = config.single_shot,
        "starting engine"
    );

    let bundler = Arc::new(Bundler::new(
        BundlerConfig {
            chain_id,
            executor,
            wrapped_native: registry.wrapped_native,
            gate: ProfitGate::from_settings(&settings),
            relay_retries: settings.relay_retries,
            relay_retry_delay: Duration::from_millis(settings.relay_retry_delay_ms),
            backrun_valid_blocks: settings.backrun_valid_blocks,
            min_simulation_attempts: settings.min_simulation_attempts,
            fail_threshold_pct: settings.fail_threshold_pct,
            outcome_timeout: Duration::from_secs(
                settings.block_time_secs * (settings.backrun_valid_blocks + 3),
            ),
            dry_run: config.dry_run,
            single_shot: config.single_shot,
        },
        Arc::clone(&book),
        Arc::clone(&pools),
        Arc::clone(&health),
        Arc::clone(&tracker),
        Arc::clone(&audit),
        relay,
        signer,
        Arc::clone(&rpc) as Arc<dyn crate::chain::ChainReader>,
        shutdown.clone(),
    ));

    let feed_config = FeedConfig::from_settings(&config.ws_url, &settings);
    let debouncer = Arc::new(Mutex::new(Debouncer::new(
        Duration::from_millis(settings.quiescence_ms),
        Duration::from_millis(settings.max_batch_delay_ms),
    )));
    let pending = Arc::new(PendingTxPool::new(Duration::from_secs(
        settings.pending_max_age_secs,
    )));
    let wake_optimizer = Arc::new(Notify::new());

    let (heads_tx, heads_rx) = mpsc::channel::<ChainHead>(64);
    let (sync_tx, sync_rx) = mpsc::channel::<ReserveUpdate>(CHANNEL_CAPACITY);
    let (hash_tx, hash_rx) = mpsc::channel::<B256>(CHANNEL_CAPACITY);
    let (pending_tx, pending_rx) = mpsc::channel::<PendingTransaction>(CHANNEL_CAPACITY);
    let (resolved_tx, resolved_rx) = mpsc::channel::<Vec<B256>>(64);
    let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>(CHANNEL_CAPACITY);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let pool_addresses = pools.pool_addresses();

    tasks.push(tokio::spawn(feeds::run_feed(
        FeedKind::Blocks,
        feed_config.clone(),
        feeds::new_heads_params(),
        Arc::clone(&health),
        Arc::clone(&pools),
        heads_tx,
        shutdown.subscribe(),
        feeds::parse_head,
    )));
    tasks.push(tokio::spawn(feeds::run_feed(
        FeedKind::PoolEvents,
        feed_config.clone(),
        feeds::sync_logs_params(&pool_addresses),
        Arc::clone(&health),
        Arc::clone(&pools),
        sync_tx,
        shutdown.subscribe(),
        feeds::parse_sync_log,
    )));
    tasks.push(tokio::spawn(feeds::run_feed(
        FeedKind::PendingTransactions,
        feed_config,
        feeds::pending_params(),
        Arc::clone(&health),
        Arc::clone(&pools),
        hash_tx,
        shutdown.subscribe(),
        feeds::parse_pending_hash,
    )));
    tasks.push(tokio::spawn(run_drain(
        Arc::clone(&debouncer),
        sync_rx,
        Arc::clone(&pools),
        Arc::clone(&health),
        Arc::clone(&wake_optimizer),
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_supervisor(
        Arc::clone(&health),
        Arc::clone(&pools),
        debouncer,
        Arc::clone(&rpc),
        settings.resync_chunk,
        Arc::clone(&wake_optimizer),
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_block_handler(
        heads_rx,
        Arc::clone(&health),
        Arc::clone(&rpc),
        Arc::clone(&pending),
        settings.resync_interval_blocks,
        resolved_tx,
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_pending_lookup(
        hash_rx,
        Arc::clone(&rpc),
        pending,
        projector.router_addresses(),
        pending_tx,
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_optimizer(
        Arc::clone(&pools),
        Arc::clone(&book),
        Arc::clone(&optimizer),
        wake_optimizer,
        trigger_tx.clone(),
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_projector(
        projector,
        pending_rx,
        resolved_rx,
        Arc::clone(&pools),
        Arc::clone(&book),
        optimizer,
        trigger_tx,
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_sweeper(
        Arc::clone(&bundler),
        Duration::from_secs(settings.block_time_secs.max(1)),
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_bundler(
        bundler,
        trigger_rx,
        settings.max_concurrent_attempts,
        shutdown.subscribe(),
    )));

    let mut stop = shutdown.subscribe();
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            break;
        }
    }
    info!("shutdown requested; waiting for tasks");

    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("tasks still running after grace period");
    }
    Ok(())
}

/// Re-optimizes dirty cycles whenever the store applies new reserves.
pub async fn run_optimizer(
    pools: Arc<PoolStore>,
    book: Arc<CycleBook>,
    optimizer: Arc<CycleOptimizer>,
    wake: Arc<Notify>,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("optimizer stopping");
                    return;
                }
                continue;
            }
        }

        let work = (Arc::clone(&pools), Arc::clone(&book), Arc::clone(&optimizer));
        let found = match tokio::task::spawn_blocking(move || {
            let (pools, book, optimizer) = work;
            optimize_dirty(&pools, &book, &optimizer)
        })
        .await
        {
            Ok(found) => found,
            Err(error) => {
                warn!(error = %error, "optimizer pass panicked");
                continue;
            }
        };
        for id in found {
            if triggers.send(Trigger::Onchain(id)).await.is_err() {
                return;
            }
        }
    }
}

/// Projects pending router swaps and queues backruns for cycles they make
/// profitable. Speculative results are dropped once their trigger resolves.
#[allow(clippy::too_many_arguments)]
pub async fn run_projector(
    projector: MempoolProjector,
    mut pending: mpsc::Receiver<PendingTransaction>,
    mut resolved: mpsc::Receiver<Vec<B256>>,
    pools: Arc<PoolStore>,
    book: Arc<CycleBook>,
    optimizer: Arc<CycleOptimizer>,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("projector stopping");
                    return;
                }
            }
            hashes = resolved.recv() => {
                let Some(hashes) = hashes else { return };
                let cleared = book.clear_futures_for(&hashes);
                if cleared > 0 {
                    debug!(cleared, "dropped speculative results for resolved transactions");
                }
            }
            tx = pending.recv() => {
                let Some(tx) = tx else { return };
                let projection = match projector.project(&tx, &pools) {
                    Ok(projection) => projection,
                    Err(ProjectionError::NotRouter | ProjectionError::UnmonitoredToken(_)) => continue,
                    Err(error) => {
                        debug!(tx = %tx.hash, error = %error, "pending swap not projected");
                        continue;
                    }
                };
                for id in optimize_projection(&pools, &book, &optimizer, &projection) {
                    if triggers.send(Trigger::Backrun(id, tx.clone())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Reads all reserves once over HTTP and optimizes every cycle.
///
/// # Errors
/// Returns error if the bulk reserve read fails.
pub async fn scan(
    registry: &Registry,
    rpc: &RpcClient,
    progress: &ProgressBar,
) -> Result<Vec<(CycleDefinition, OpportunityResult)>> {
    let pools = PoolStore::new(registry.pools.clone(), &registry.cycles);
    let book = CycleBook::new(registry.cycles.clone());
    bulk_resync(rpc, &pools, registry.settings.resync_chunk, progress).await?;

    let optimizer = CycleOptimizer::default();
    optimize_cycles(&pools, &book, &optimizer, &book.active_ids());

    Ok(book
        .opportunities()
        .into_iter()
        .filter_map(|(id, result)| book.definition(id).cloned().map(|cycle| (cycle, result)))
        .collect())
}
