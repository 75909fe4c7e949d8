//! Submission of profitable cycles as relay bundles.
//!
//! An attempt walks a [`Submission`] through its states:
//!
//! ```text
//! Idle -> PayloadBuilt -> Simulated -> Submitted -> Confirmed
//!   \__________\______________\____________\_____-> Dropped
//! ```
//!
//! The relay simulation runs twice: first with a zero priority fee to
//! learn the real gas use, then again with the bribe folded into the
//! priority fee. Only the second, fully priced bundle is sent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{hex, Address, Bytes, B256, U256};
use eyre::{Context, Result};
use flash_data::pipeline::Health;
use flash_data::store::{BlacklistEntry, Store};
use flash_data::types::{BundleRecord, FeedKind, PendingTransaction, RESYNC_SEQUENCE};
use flash_data::{CycleId, PoolStore};
use flash_sim::view::PathSnapshot;
use flash_sim::CycleBook;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::chain::ChainReader;
use crate::gas::{format_eth, GasParams, ProfitGate};
use crate::payload::ExecutionPayload;
use crate::relay::{with_retries, BundleRelay, SimulationReport};
use crate::signer::{NonceManager, SignedTransaction, TransactionSigner, TxRequest};
use crate::tracker::CycleTracker;

/// Lifecycle of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    PayloadBuilt,
    Simulated,
    Submitted,
    Confirmed,
    Dropped,
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Confirmed | SubmissionState::Dropped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionState::Idle => "idle",
            SubmissionState::PayloadBuilt => "payload_built",
            SubmissionState::Simulated => "simulated",
            SubmissionState::Submitted => "submitted",
            SubmissionState::Confirmed => "confirmed",
            SubmissionState::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal submission transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SubmissionState,
    pub to: SubmissionState,
}

/// State machine for one attempt on one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub cycle: CycleId,
    state: SubmissionState,
}

impl Submission {
    pub fn new(cycle: CycleId) -> Self {
        Self {
            cycle,
            state: SubmissionState::Idle,
        }
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Errors
    /// Returns [`TransitionError`] unless `next` is the successor of the
    /// current state, or `Dropped` from any non-terminal state.
    pub fn advance(&mut self, next: SubmissionState) -> Result<(), TransitionError> {
        use SubmissionState::*;

        let legal = matches!(
            (self.state, next),
            (Idle, PayloadBuilt)
                | (PayloadBuilt, Simulated)
                | (Simulated, Submitted)
                | (Submitted, Confirmed)
        ) || (next == Dropped && !self.state.is_terminal());

        if !legal {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn drop_attempt(&mut self) {
        if !self.state.is_terminal() {
            self.state = SubmissionState::Dropped;
        }
    }
}

/// Execution policy derived from settings and the command line.
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub chain_id: u64,
    pub executor: Address,
    pub wrapped_native: Address,
    pub gate: ProfitGate,
    pub relay_retries: u32,
    pub relay_retry_delay: Duration,
    pub backrun_valid_blocks: u64,
    pub min_simulation_attempts: u32,
    pub fail_threshold_pct: u32,
    /// Longest wait for the last target block before giving up on a receipt.
    pub outcome_timeout: Duration,
    /// Simulate only; never send.
    pub dry_run: bool,
    /// Stop the engine after the first confirmed trade.
    pub single_shot: bool,
}

/// Work item for the bundler.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Trade against the confirmed state.
    Onchain(CycleId),
    /// Trade behind a pending transaction.
    Backrun(CycleId, PendingTransaction),
}

impl Trigger {
    pub fn cycle(&self) -> CycleId {
        match self {
            Trigger::Onchain(id) | Trigger::Backrun(id, _) => *id,
        }
    }
}

/// A bundle that was accepted by the relay and is awaiting inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBundle {
    pub bundle_hash: B256,
    pub tx_hash: B256,
    pub target_blocks: Vec<u64>,
    pub net_profit: u128,
}

/// How an attempt ended before any receipt check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Skipped(&'static str),
    BelowThreshold { net_profit: u128 },
    SimulationFailed(String),
    RelayUnavailable(String),
    DryRun { net_profit: u128 },
    Submitted(PendingBundle),
}

/// Result of one blacklist sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub outdated: Vec<CycleId>,
    pub blacklisted: Vec<CycleId>,
}

/// Shared execution context for all attempts.
pub struct Bundler {
    config: BundlerConfig,
    book: Arc<CycleBook>,
    pools: Arc<PoolStore>,
    health: Arc<Health>,
    tracker: Arc<CycleTracker>,
    audit: Arc<Store>,
    relay: Arc<dyn BundleRelay>,
    signer: Arc<dyn TransactionSigner>,
    chain: Arc<dyn ChainReader>,
    nonces: NonceManager,
    in_flight: Mutex<HashSet<CycleId>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("config", &self.config)
            .field("signer", &self.signer.address())
            .finish_non_exhaustive()
    }
}

/// Releases a cycle's in-flight slot when the attempt ends.
struct InFlightGuard<'a> {
    bundler: &'a Bundler,
    cycle: CycleId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.bundler.in_flight_set().remove(&self.cycle);
    }
}

impl Bundler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BundlerConfig,
        book: Arc<CycleBook>,
        pools: Arc<PoolStore>,
        health: Arc<Health>,
        tracker: Arc<CycleTracker>,
        audit: Arc<Store>,
        relay: Arc<dyn BundleRelay>,
        signer: Arc<dyn TransactionSigner>,
        chain: Arc<dyn ChainReader>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            book,
            pools,
            health,
            tracker,
            audit,
            relay,
            signer,
            chain,
            nonces: NonceManager::new(),
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    fn in_flight_set(&self) -> std::sync::MutexGuard<'_, HashSet<CycleId>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `cycle` for one attempt; `None` if an attempt is already running.
    fn claim(&self, cycle: CycleId) -> Option<InFlightGuard<'_>> {
        self.in_flight_set()
            .insert(cycle)
            .then_some(InFlightGuard {
                bundler: self,
                cycle,
            })
    }

    /// Forgets the local nonce so the next attempt re-reads it from chain.
    pub async fn on_new_block(&self) {
        self.nonces.invalidate().await;
    }

    /// Runs one attempt end to end, including the receipt check.
    ///
    /// # Errors
    /// Returns error on signing, nonce or persistence failures. Relay and
    /// simulation failures are reported through the outcome instead.
    pub async fn attempt(&self, trigger: Trigger) -> Result<SubmissionState> {
        let cycle = trigger.cycle();
        let Some(_guard) = self.claim(cycle) else {
            debug!(cycle, "attempt already in flight");
            return Ok(SubmissionState::Idle);
        };

        let mut submission = Submission::new(cycle);
        let outcome = match self.execute(&mut submission, &trigger).await {
            Ok(outcome) => outcome,
            Err(error) => {
                submission.drop_attempt();
                return Err(error);
            }
        };

        match outcome {
            AttemptOutcome::Submitted(pending) => self.await_outcome(&mut submission, &pending).await,
            other => {
                debug!(cycle, outcome = ?other, "attempt finished without submission");
                submission.drop_attempt();
                Ok(submission.state())
            }
        }
    }

    /// Builds, simulates, prices and sends the bundle for `trigger`.
    ///
    /// # Errors
    /// See [`Bundler::attempt`].
    #[tracing::instrument(skip_all, fields(cycle = submission.cycle))]
    pub async fn execute(
        &self,
        submission: &mut Submission,
        trigger: &Trigger,
    ) -> Result<AttemptOutcome> {
        let mut reserved = None;
        let outcome = self.try_execute(submission, trigger, &mut reserved).await;
        // Only a bundle the relay accepted keeps its nonce.
        if let Some(nonce) = reserved {
            self.nonces.release(nonce).await;
        }
        outcome
    }

    async fn try_execute(
        &self,
        submission: &mut Submission,
        trigger: &Trigger,
        reserved: &mut Option<u64>,
    ) -> Result<AttemptOutcome> {
        let id = submission.cycle;
        let Some(cycle) = self.book.definition(id) else {
            return Ok(AttemptOutcome::Skipped("unknown cycle"));
        };
        if !self.book.is_active(id) {
            return Ok(AttemptOutcome::Skipped("cycle blacklisted"));
        }
        if cycle.repay_token != self.config.wrapped_native {
            return Ok(AttemptOutcome::Skipped("profit not in wrapped native token"));
        }
        if !self
            .health
            .submissions_allowed(chrono::Utc::now().timestamp().max(0) as u64)
        {
            return Ok(AttemptOutcome::Skipped("ingestion degraded"));
        }

        let epoch = self.book.epoch(id);
        let (opportunity, victim) = match trigger {
            Trigger::Onchain(_) => (self.book.best(id), None),
            Trigger::Backrun(_, pending) => {
                let Some(raw) = pending.raw.clone() else {
                    return Ok(AttemptOutcome::Skipped("victim raw transaction unavailable"));
                };
                (self.book.best_future(id), Some(raw))
            }
        };
        if opportunity.is_cleared() {
            return Ok(AttemptOutcome::Skipped("no opportunity"));
        }
        let Some(path) = PathSnapshot::capture(&self.pools, cycle) else {
            return Ok(AttemptOutcome::Skipped("pool missing from store"));
        };

        let payload = ExecutionPayload::build(cycle, &opportunity, &path, self.config.executor)
            .wrap_err_with(|| format!("failed to build payload for cycle {}", cycle.id))?;
        let calldata = payload.executor_calldata(U256::ZERO);
        advance(submission, SubmissionState::PayloadBuilt)?;

        let gate = &self.config.gate;
        let head = self.health.head();
        let estimate = self.tracker.gas_estimate(id).unwrap_or(gate.default_gas);
        let unpriced = gate.gas_params(estimate, head.base_fee, 0);
        let Some(net) = self.gated_profit(opportunity.profit_amount, estimate, &unpriced, head.base_fee)
        else {
            return Ok(AttemptOutcome::BelowThreshold { net_profit: 0 });
        };
        debug!(estimate, net = %format_eth(net), "pre-simulation gate passed");

        let nonce = self
            .nonces
            .reserve(self.chain.as_ref(), self.signer.address())
            .await?;
        *reserved = Some(nonce);
        let probe = self.sign(nonce, &calldata, unpriced).await?;
        let report = match self.simulate(&victim, &probe, head.number + 1).await {
            Ok(report) => report,
            Err(message) => return Ok(AttemptOutcome::RelayUnavailable(message)),
        };
        if let Some(error) = report.first_error() {
            self.record_failure(id, epoch, error);
            return Ok(AttemptOutcome::SimulationFailed(error.to_string()));
        }

        let gas_used = match report.gas_used_by(self.signer.address()) {
            0 => estimate,
            used => used,
        };
        if self.book.epoch(id) == epoch {
            self.tracker.record_simulation(id, false);
            self.persist_stats(id, self.tracker.set_gas(id, gas_used));
        }
        advance(submission, SubmissionState::Simulated)?;

        let unpriced = gate.gas_params(gas_used, head.base_fee, 0);
        let Some(net) = self.gated_profit(opportunity.profit_amount, gas_used, &unpriced, head.base_fee)
        else {
            return Ok(AttemptOutcome::BelowThreshold { net_profit: 0 });
        };

        let bribe = gate.bribe(net);
        let priority = gate.priority_fee_for(bribe, gas_used);
        let priced = gate.gas_params(gas_used, head.base_fee, priority);
        let signed = self.sign(nonce, &calldata, priced).await?;
        let report = match self.simulate(&victim, &signed, head.number + 1).await {
            Ok(report) => report,
            Err(message) => return Ok(AttemptOutcome::RelayUnavailable(message)),
        };
        if let Some(error) = report.first_error() {
            self.record_failure(id, epoch, error);
            return Ok(AttemptOutcome::SimulationFailed(error.to_string()));
        }

        let bundle: Vec<Bytes> = victim
            .iter()
            .cloned()
            .chain(std::iter::once(signed.raw.clone()))
            .collect();
        let valid_blocks = if victim.is_some() {
            self.config.backrun_valid_blocks.max(1)
        } else {
            1
        };
        let target_blocks: Vec<u64> = (1..=valid_blocks).map(|offset| head.number + offset).collect();

        if self.config.dry_run {
            info!(
                cycle = %cycle.id,
                net = %format_eth(net),
                bribe = %format_eth(bribe),
                gas = gas_used,
                "dry run: bundle simulated, not sent"
            );
            return Ok(AttemptOutcome::DryRun { net_profit: net });
        }

        let mut bundle_hash = None;
        for &block in &target_blocks {
            let relay = Arc::clone(&self.relay);
            let sent = with_retries(self.config.relay_retries, self.config.relay_retry_delay, || {
                let relay = Arc::clone(&relay);
                let bundle = bundle.clone();
                async move { relay.send(&bundle, block).await }
            })
            .await;
            match sent {
                Ok(hash) => {
                    bundle_hash.get_or_insert(hash);
                }
                Err(error) => warn!(block, error = %error, "failed to send bundle"),
            }
        }
        let Some(bundle_hash) = bundle_hash else {
            return Ok(AttemptOutcome::RelayUnavailable(
                "no target block accepted the bundle".to_string(),
            ));
        };
        *reserved = None;
        advance(submission, SubmissionState::Submitted)?;

        self.audit
            .record_bundle(&BundleRecord {
                bundle_hash: format!("{bundle_hash:#x}"),
                cycle_id: cycle.id.clone(),
                target_blocks: target_blocks.clone(),
                signed_transactions: bundle.iter().map(hex::encode_prefixed).collect(),
                profit_wei: net.to_string(),
                submitted_at: chrono::Utc::now().to_rfc3339(),
            })
            .wrap_err("failed to append bundle to audit log")?;
        self.book.clear(id);

        info!(
            cycle = %cycle.id,
            bundle = %bundle_hash,
            blocks = ?target_blocks,
            net = %format_eth(net),
            bribe = %format_eth(bribe),
            "bundle submitted"
        );

        Ok(AttemptOutcome::Submitted(PendingBundle {
            bundle_hash,
            tx_hash: signed.hash,
            target_blocks,
            net_profit: net,
        }))
    }

    /// Waits past the last target block and resolves the submission from
    /// the executor transaction's receipt.
    ///
    /// # Errors
    /// Returns error if the outcome cannot be written to the audit log.
    pub async fn await_outcome(
        &self,
        submission: &mut Submission,
        pending: &PendingBundle,
    ) -> Result<SubmissionState> {
        let last_block = pending.target_blocks.last().copied().unwrap_or_default();
        let mut heads = self.health.subscribe_heads();
        let passed = tokio::time::timeout(self.config.outcome_timeout, async {
            loop {
                let number = heads.borrow_and_update().number;
                if number > last_block {
                    return true;
                }
                if heads.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        let receipt = if passed {
            match self.chain.receipt(pending.tx_hash).await {
                Ok(receipt) => receipt,
                Err(error) => {
                    warn!(tx = %pending.tx_hash, error = %error, "receipt lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let confirmed = receipt.is_some_and(|receipt| receipt.success);
        if confirmed {
            advance(submission, SubmissionState::Confirmed)?;
        } else {
            advance(submission, SubmissionState::Dropped)?;
        }
        self.audit
            .set_bundle_outcome(&format!("{:#x}", pending.bundle_hash), submission.state().as_str())
            .wrap_err("failed to record bundle outcome")?;

        if confirmed {
            info!(
                cycle = submission.cycle,
                tx = %pending.tx_hash,
                block = receipt.map(|receipt| receipt.block_number),
                net = %format_eth(pending.net_profit),
                "bundle confirmed"
            );
            if self.config.single_shot {
                info!("single-shot trade confirmed; shutting down");
                self.shutdown.send_replace(true);
            }
        } else {
            info!(cycle = submission.cycle, bundle = %pending.bundle_hash, "bundle not included");
        }
        Ok(submission.state())
    }

    /// Re-checks cycles that keep failing simulation.
    ///
    /// A cycle whose pools differ on chain from older store state was
    /// simulated against stale reserves: the fresh reserves are applied and
    /// its counters reset. A store already ahead of the read defers the
    /// decision to the next sweep. Otherwise the cycle is blacklisted.
    ///
    /// # Errors
    /// Returns error if the blacklist cannot be persisted.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let candidates = self.tracker.candidates(
            self.config.min_simulation_attempts,
            self.config.fail_threshold_pct,
        );
        if candidates.is_empty() {
            return Ok(report);
        }

        let block = match self.chain.block_number().await {
            Ok(block) => block,
            Err(error) => {
                warn!(error = %error, "blacklist sweep skipped: block number unavailable");
                return Ok(report);
            }
        };

        for id in candidates {
            let Some(cycle) = self.book.definition(id) else {
                continue;
            };
            if !self.book.is_active(id) {
                self.tracker.remove(id);
                continue;
            }
            let addresses: Vec<Address> = cycle.pools().copied().collect();
            let onchain = match self.chain.reserves_at(&addresses, block).await {
                Ok(reserves) if reserves.len() == addresses.len() => reserves,
                Ok(_) => {
                    debug!(cycle = %cycle.id, "incomplete reserve read; retrying next sweep");
                    continue;
                }
                Err(error) => {
                    debug!(cycle = %cycle.id, error = %error, "liveness read failed");
                    continue;
                }
            };

            // Only a pool whose local state predates the read can be outdated.
            let mut ahead = false;
            let outdated: Vec<_> = onchain
                .iter()
                .filter(|fresh| {
                    self.pools.snapshot(fresh.pool).is_some_and(|local| {
                        if (local.reserve_a, local.reserve_b) == (fresh.reserve0, fresh.reserve1) {
                            return false;
                        }
                        if local.last_update_block > block {
                            ahead = true;
                            return false;
                        }
                        true
                    })
                })
                .collect();

            if outdated.is_empty() && ahead {
                debug!(cycle = %cycle.id, block, "store is ahead of the liveness read; retrying next sweep");
                continue;
            }

            if !outdated.is_empty() {
                let generation = self.pools.current_generation_for(FeedKind::PoolEvents);
                let applied = outdated
                    .iter()
                    .filter(|fresh| {
                        self.pools.apply(
                            fresh.pool,
                            fresh.reserve0,
                            fresh.reserve1,
                            block,
                            RESYNC_SEQUENCE,
                            generation,
                        )
                    })
                    .count();
                if applied == 0 {
                    debug!(cycle = %cycle.id, block, "newer reserves landed during the sweep; retrying next sweep");
                    continue;
                }
                self.persist_stats(id, self.tracker.reset(id));
                info!(cycle = %cycle.id, pools = applied, "cycle was outdated; counters reset");
                report.outdated.push(id);
                continue;
            }

            let stats = self.tracker.remove(id).unwrap_or_default();
            self.book.deactivate(id);
            self.audit
                .blacklist_cycle(&BlacklistEntry {
                    cycle_id: cycle.id.clone(),
                    reason: "repeated simulation failures".to_string(),
                    simulations: stats.simulations,
                    failures: stats.failures,
                    blacklisted_at: chrono::Utc::now().to_rfc3339(),
                })
                .wrap_err_with(|| format!("failed to blacklist cycle {}", cycle.id))?;
            warn!(
                cycle = %cycle.id,
                simulations = stats.simulations,
                failures = stats.failures,
                "cycle blacklisted"
            );
            report.blacklisted.push(id);
        }
        Ok(report)
    }

    fn gated_profit(
        &self,
        profit: U256,
        gas: u64,
        params: &GasParams,
        base_fee: u128,
    ) -> Option<u128> {
        let gate = &self.config.gate;
        let price = params.effective_price(base_fee);
        let net = gate.net_profit(profit, gas, price)?;
        let cost = u128::from(gas).saturating_mul(price);
        gate.passes(net, cost).then_some(net)
    }

    async fn sign(&self, nonce: u64, calldata: &Bytes, gas: GasParams) -> Result<SignedTransaction> {
        self.signer
            .sign(&TxRequest {
                chain_id: self.config.chain_id,
                nonce,
                to: self.config.executor,
                input: calldata.clone(),
                value: U256::ZERO,
                gas,
            })
            .await
            .wrap_err("failed to sign executor transaction")
    }

    async fn simulate(
        &self,
        victim: &Option<Bytes>,
        ours: &SignedTransaction,
        block: u64,
    ) -> Result<SimulationReport, String> {
        let bundle: Vec<Bytes> = victim
            .iter()
            .cloned()
            .chain(std::iter::once(ours.raw.clone()))
            .collect();
        let relay = Arc::clone(&self.relay);
        with_retries(self.config.relay_retries, self.config.relay_retry_delay, || {
            let relay = Arc::clone(&relay);
            let bundle = bundle.clone();
            async move { relay.simulate(&bundle, block).await }
        })
        .await
        .map_err(|error| {
            warn!(block, error = %error, "bundle simulation unavailable");
            error.to_string()
        })
    }

    fn record_failure(&self, id: CycleId, epoch: u64, error: &str) {
        if self.book.epoch(id) != epoch {
            debug!(cycle = id, "cycle re-optimized during attempt; failure not counted");
            return;
        }
        let stats = self.tracker.record_simulation(id, true);
        self.persist_stats(id, stats);
        info!(
            cycle = id,
            simulations = stats.simulations,
            failures = stats.failures,
            error,
            "bundle simulation failed"
        );
    }

    fn persist_stats(&self, id: CycleId, stats: flash_data::store::CycleStats) {
        let Some(cycle) = self.book.definition(id) else {
            return;
        };
        if let Err(error) = self.audit.save_cycle_stats(&cycle.id, stats) {
            warn!(cycle = %cycle.id, error = %error, "failed to persist cycle stats");
        }
    }
}

fn advance(submission: &mut Submission, next: SubmissionState) -> Result<()> {
    submission
        .advance(next)
        .wrap_err_with(|| format!("cycle {} submission", submission.cycle))
}

/// Runs attempts for incoming triggers, at most `max_concurrent` at once.
pub async fn run_bundler(
    bundler: Arc<Bundler>,
    mut triggers: mpsc::Receiver<Trigger>,
    max_concurrent: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut heads = bundler.health.subscribe_heads();

    loop {
        let trigger = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("bundler stopping");
                    return;
                }
                continue;
            }
            changed = heads.changed() => {
                if changed.is_ok() {
                    bundler.on_new_block().await;
                }
                continue;
            }
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => return,
            },
        };

        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            debug!(cycle = trigger.cycle(), "attempt limit reached; trigger dropped");
            continue;
        };
        let bundler = Arc::clone(&bundler);
        tokio::spawn(async move {
            let cycle = trigger.cycle();
            if let Err(error) = bundler.attempt(trigger).await {
                warn!(cycle, error = %error, "execution attempt failed");
            }
            drop(permit);
        });
    }
}

/// Periodically blacklists cycles that keep failing simulation.
pub async fn run_sweeper(
    bundler: Arc<Bundler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        match bundler.sweep().await {
            Ok(report) if !report.outdated.is_empty() || !report.blacklisted.is_empty() => {
                debug!(
                    outdated = report.outdated.len(),
                    blacklisted = report.blacklisted.len(),
                    "blacklist sweep complete"
                );
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "blacklist sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubmissionState::*;

    #[test]
    fn happy_path_transitions() {
        let mut submission = Submission::new(0);
        for next in [PayloadBuilt, Simulated, Submitted, Confirmed] {
            submission.advance(next).expect("transition should be legal");
        }
        assert_eq!(submission.state(), Confirmed);
    }

    #[test]
    fn any_live_state_can_drop() {
        for path in [&[][..], &[PayloadBuilt][..], &[PayloadBuilt, Simulated][..]] {
            let mut submission = Submission::new(1);
            for next in path {
                submission.advance(*next).expect("prefix should be legal");
            }
            submission.advance(Dropped).expect("drop should be legal");
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut submission = Submission::new(2);
        assert_eq!(
            submission.advance(Simulated),
            Err(TransitionError {
                from: Idle,
                to: Simulated
            })
        );

        submission.advance(Dropped).expect("drop from idle");
        assert!(submission.advance(Dropped).is_err());
        assert!(submission.advance(PayloadBuilt).is_err());

        let mut confirmed = Submission::new(3);
        for next in [PayloadBuilt, Simulated, Submitted, Confirmed] {
            confirmed.advance(next).expect("legal");
        }
        assert!(confirmed.advance(Dropped).is_err());
    }
}
