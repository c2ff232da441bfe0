//! # Cycle Driver
//!
//! The periodic loop that turns a wallet fleet into scheduled work. Every
//! cycle it enumerates (wallet, provider) faucet candidates and
//! (wallet, action) candidates, walks each through the gate chain
//! (dead-letter, throttle, backoff, ledger, entropy, idempotency), dispatches
//! survivors through the worker pool under sticky session context, and
//! aggregates everything into a `CycleReport`.
//!
//! Within a shard every wallet runs as its own task on a `JoinSet`, with the
//! pool's semaphore bounding actual dispatch concurrency; entropy waits only
//! ever delay that wallet's task. Shards run in priority order with jittered
//! stagger gaps between them so the fleet never fires as one block.
//! Cancellation is honored at every suspension point.

use crate::actions::ActionScheduler;
use crate::backoff::ProviderBackoff;
use crate::config::{FarmConfig, ProviderConfig};
use crate::deadletter::DeadLetterTracker;
use crate::entropy::{Decision, EntropyScheduler, ScheduleKind};
use crate::error::TaskError;
use crate::idempotency::IdempotencyGuard;
use crate::ledger::{CooldownKey, CooldownLedger, Eligibility};
use crate::metrics::MetricsCollector;
use crate::pool::{OutcomeRecorder, WorkerPool};
use crate::session::{SessionBroker, TrafficClass};
use crate::store::{OutcomeBatchItem, Store};
use crate::throttle::AutoThrottle;
use crate::traits::{CaptchaBroker, FaucetClient, ProtocolAdapter, Task, TaskKind, TaskReceipt};
use crate::wallet::WalletRef;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-cycle accounting, logged under the `cycle` target.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stalled: u64,
    pub deferred: DeferralCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeferralCounts {
    pub cooldown: u64,
    pub duplicate: u64,
    pub rate_limited: u64,
    pub throttled: u64,
    pub lock_contended: u64,
    pub skipped: u64,
    pub parked: u64,
}

impl CycleReport {
    fn absorb(&mut self, other: &CycleReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.stalled += other.stalled;
        self.deferred.cooldown += other.deferred.cooldown;
        self.deferred.duplicate += other.deferred.duplicate;
        self.deferred.rate_limited += other.deferred.rate_limited;
        self.deferred.throttled += other.deferred.throttled;
        self.deferred.lock_contended += other.deferred.lock_contended;
        self.deferred.skipped += other.deferred.skipped;
        self.deferred.parked += other.deferred.parked;
    }
}

enum Attempt {
    Succeeded,
    Failed,
    Deferred(&'static str),
}

/// What one wallet's task brings back to the cycle: its share of the
/// counters plus the task-log rows for the batch insert.
#[derive(Default)]
struct WalletTally {
    report: CycleReport,
    outcomes: Vec<OutcomeBatchItem>,
}

pub struct Driver {
    config: FarmConfig,
    wallets: Vec<WalletRef>,
    store: Arc<Store>,
    ledger: Arc<CooldownLedger>,
    idempotency: Arc<IdempotencyGuard>,
    backoff: Arc<ProviderBackoff>,
    throttle: Arc<AutoThrottle>,
    entropy: Arc<EntropyScheduler>,
    sessions: Arc<SessionBroker>,
    dead_letters: Arc<DeadLetterTracker>,
    actions: Arc<ActionScheduler>,
    pool: Arc<WorkerPool>,
    recorder: OutcomeRecorder,
    adapter: Arc<dyn ProtocolAdapter>,
    faucet: Arc<dyn FaucetClient>,
    captcha: Option<Arc<dyn CaptchaBroker>>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FarmConfig,
        wallets: Vec<WalletRef>,
        store: Arc<Store>,
        adapter: Arc<dyn ProtocolAdapter>,
        faucet: Arc<dyn FaucetClient>,
        captcha: Option<Arc<dyn CaptchaBroker>>,
        proxies: Vec<String>,
        user_agents: Vec<String>,
    ) -> Self {
        let ledger = Arc::new(CooldownLedger::new(
            Arc::clone(&store),
            config.scheduling.over_cooldown_jitter_min,
            config.scheduling.over_cooldown_jitter_max,
        ));
        let idempotency = Arc::new(IdempotencyGuard::new(Arc::clone(&store)));
        let backoff = Arc::new(ProviderBackoff::new(config.backoff.clone()));
        let throttle = Arc::new(AutoThrottle::new(config.throttle.clone()));
        let entropy = Arc::new(EntropyScheduler::new(config.scheduling.clone()));
        let sessions = Arc::new(SessionBroker::new(
            Arc::clone(&store),
            config.session.clone(),
            proxies,
            user_agents,
        ));
        let dead_letters = Arc::new(DeadLetterTracker::new(
            Arc::clone(&store),
            config.driver.stall_threshold,
        ));
        let actions = Arc::new(ActionScheduler::new(
            Arc::clone(&store),
            config.actions.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            config.pool.max_concurrency,
            config.pool.task_timeout,
        ));
        let recorder = OutcomeRecorder {
            ledger: Arc::clone(&ledger),
            backoff: Arc::clone(&backoff),
            throttle: Arc::clone(&throttle),
            dead_letter: Arc::clone(&dead_letters),
        };

        Self {
            config,
            wallets,
            store,
            ledger,
            idempotency,
            backoff,
            throttle,
            entropy,
            sessions,
            dead_letters,
            actions,
            pool,
            recorder,
            adapter,
            faucet,
            captcha,
        }
    }

    /// Runs cycles until cancelled. One report per cycle, a metrics snapshot
    /// on the way out.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut cycle: u64 = 0;
        info!(
            "Driver started: {} wallets, {} providers, cycle every {:?}",
            self.wallets.len(),
            self.config.providers.len(),
            self.config.driver.cycle_interval
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let report = Arc::clone(&self)
                .run_cycle(cycle, Utc::now(), &token)
                .await?;
            info!(
                target: "cycle",
                "Cycle {} done: {} attempted, {} SUCCESS, {} FAILED, {} stalled, {} deferred",
                report.cycle,
                report.attempted,
                report.succeeded,
                report.failed,
                report.stalled,
                report.deferred.total()
            );

            cycle += 1;
            tokio::select! {
                _ = sleep(self.config.driver.cycle_interval) => {}
                _ = token.cancelled() => break,
            }
        }

        info!(
            "Driver stopped after {} cycles; metrics: {}",
            cycle,
            MetricsCollector::global().to_json()
        );
        Ok(())
    }

    /// One full pass over the fleet. Wallets within a shard fan out onto a
    /// `JoinSet` and the pool's semaphore bounds how many dispatch at once.
    pub async fn run_cycle(
        self: Arc<Self>,
        cycle: u64,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };
        let mut outcomes: Vec<OutcomeBatchItem> = Vec::new();

        let mut shards: BTreeMap<u32, Vec<WalletRef>> = BTreeMap::new();
        for wallet in &self.wallets {
            shards
                .entry(wallet.shard_id)
                .or_default()
                .push(wallet.clone());
        }

        let mut first_shard = true;
        for (shard_id, wallets) in shards {
            if token.is_cancelled() {
                break;
            }
            if !first_shard {
                self.stagger_pause(token).await;
            }
            first_shard = false;

            debug!("Cycle {}: shard {} ({} wallets)", cycle, shard_id, wallets.len());
            let mut set = JoinSet::new();
            for wallet in wallets {
                let driver = Arc::clone(&self);
                let token = token.clone();
                set.spawn(async move { driver.process_wallet(&wallet, cycle, now, &token).await });
            }
            while let Some(joined) = set.join_next().await {
                let tally = joined
                    .map_err(|e| anyhow::anyhow!("wallet task panicked: {e}"))??;
                report.absorb(&tally.report);
                outcomes.extend(tally.outcomes);
            }
        }

        if !outcomes.is_empty() {
            self.store.batch_log_outcomes(&outcomes).await?;
        }

        Ok(report)
    }

    /// Jittered gap between shards so shard boundaries stay unsynchronized.
    async fn stagger_pause(&self, token: &CancellationToken) {
        let base = self.config.driver.shard_stagger.as_secs_f64();
        let jittered = base * rand::thread_rng().gen_range(0.7..1.3);
        tokio::select! {
            _ = sleep(Duration::from_secs_f64(jittered)) => {}
            _ = token.cancelled() => {}
        }
    }

    async fn process_wallet(
        &self,
        wallet: &WalletRef,
        cycle: u64,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<WalletTally> {
        let mut tally = WalletTally::default();

        // Faucets: priority order, first success per chain wins the cycle.
        let providers: Vec<ProviderConfig> = self
            .config
            .providers_for_chain(&wallet.chain)
            .into_iter()
            .cloned()
            .collect();
        for provider in &providers {
            if token.is_cancelled() {
                return Ok(tally);
            }
            let task = Task::new(TaskKind::FaucetClaim, wallet.clone(), provider.name.clone());
            let outcome = self
                .attempt(&task, Some(provider), cycle, now, token, &mut tally)
                .await?;
            if matches!(outcome, Attempt::Succeeded) {
                break;
            }
        }

        // On-chain actions, in the shard's deterministic daily order. The
        // allowance counts this wallet's in-cycle successes locally since
        // the task log is only flushed at cycle end.
        let mut allowance = self.actions.remaining_daily_allowance(wallet, now).await?;
        if allowance == 0 {
            debug!("Wallet {} hit the daily action cap", wallet.short());
            return Ok(tally);
        }
        for kind in ActionScheduler::ordered_kinds(wallet.shard_id, now) {
            if token.is_cancelled() || allowance == 0 {
                break;
            }
            let task = Task::new(kind, wallet.clone(), kind.as_str());
            let outcome = self.attempt(&task, None, cycle, now, token, &mut tally).await?;
            if matches!(outcome, Attempt::Succeeded) {
                allowance -= 1;
            }
        }

        Ok(tally)
    }

    /// The gate chain plus dispatch for one candidate task.
    async fn attempt(
        &self,
        task: &Task,
        provider: Option<&ProviderConfig>,
        cycle: u64,
        now: DateTime<Utc>,
        token: &CancellationToken,
        tally: &mut WalletTally,
    ) -> Result<Attempt> {
        let metrics = MetricsCollector::global();
        let wallet = &task.wallet;

        // Gate 1: parked work stays parked until an operator clears it.
        let task_key = DeadLetterTracker::task_key(
            task.kind.as_str(),
            &task.provider,
            &wallet.address,
            &wallet.chain,
        );
        if self.dead_letters.is_stalled(&task_key).await? {
            tally.report.deferred.parked += 1;
            return Ok(Attempt::Deferred("stalled"));
        }

        // Gate 2: cohort pause.
        if self.throttle.is_paused(&task.cohort(), now).is_some() {
            tally.report.deferred.throttled += 1;
            metrics.record_deferral("throttled");
            return Ok(Attempt::Deferred("throttled"));
        }

        // Gate 3: provider backoff.
        if self.backoff.check(&task.provider, now).is_some() {
            tally.report.deferred.rate_limited += 1;
            metrics.record_deferral("rate_limited");
            return Ok(Attempt::Deferred("rate_limited"));
        }

        // Gate 4: cooldown ledger and daily limit.
        let key = CooldownKey::new(task.kind, &task.provider, &wallet.address, &wallet.chain);
        let daily_limit = provider.map(|p| p.daily_limit).unwrap_or(0);
        match self.ledger.is_eligible(&key, daily_limit, now).await? {
            Eligibility::Ready => {}
            Eligibility::CoolingDown { until } => {
                debug!(
                    "{} for {} cooling down until {}",
                    task.kind.as_str(),
                    wallet.short(),
                    until
                );
                tally.report.deferred.cooldown += 1;
                metrics.record_deferral("cooldown");
                return Ok(Attempt::Deferred("cooldown"));
            }
            Eligibility::DailyLimitReached { .. } => {
                tally.report.deferred.cooldown += 1;
                metrics.record_deferral("cooldown");
                return Ok(Attempt::Deferred("daily_limit"));
            }
        }

        // Gate 5: human-pattern scheduling. The wait only suspends this
        // wallet's task, never the rest of the shard.
        let schedule_kind = if task.kind.is_action() {
            ScheduleKind::Action
        } else {
            ScheduleKind::Faucet
        };
        let dispatch_at =
            match self
                .entropy
                .next_eligible_instant(&wallet.address, now, cycle, schedule_kind)
            {
                Decision::Skip => {
                    tally.report.deferred.skipped += 1;
                    metrics.record_deferral("skipped");
                    return Ok(Attempt::Deferred("skipped"));
                }
                Decision::At(t) => t,
            };
        let delay = dispatch_at.signed_duration_since(Utc::now());
        if delay > chrono::Duration::zero() {
            let delay_std = Duration::from_millis(delay.num_milliseconds().max(0) as u64);
            if delay_std > self.config.driver.cycle_interval {
                // slot falls past this cycle's horizon
                tally.report.deferred.skipped += 1;
                metrics.record_deferral("skipped");
                return Ok(Attempt::Deferred("skipped"));
            }
            tokio::select! {
                _ = sleep(delay_std) => {}
                _ = token.cancelled() => return Ok(Attempt::Deferred("cancelled")),
            }
        }

        // Gate 6: duplicate suppression, claimed last so a claim always
        // corresponds to an actual dispatch.
        let idem_key =
            IdempotencyGuard::key_for(&task.provider, &wallet.address, &wallet.chain, now);
        if !self.idempotency.try_claim(&idem_key, now).await? {
            debug!(
                "Duplicate dispatch suppressed for {} {}",
                task.kind.as_str(),
                wallet.short()
            );
            tally.report.deferred.duplicate += 1;
            metrics.record_deferral("duplicate");
            return Ok(Attempt::Deferred("duplicate"));
        }

        tally.report.attempted += 1;
        let started = std::time::Instant::now();
        let result = self.dispatch(task, provider, now).await;
        let duration = started.elapsed();

        // Pool-level contention is still a deferral; hand the claim back.
        if let Err(TaskError::LockContended { .. }) = &result {
            self.idempotency.release(&idem_key).await?;
            tally.report.attempted -= 1;
            tally.report.deferred.lock_contended += 1;
            metrics.record_deferral("lock_contended");
            return Ok(Attempt::Deferred("lock_contended"));
        }

        let base_cooldown = provider
            .map(|p| p.cooldown())
            .unwrap_or_else(|| self.config.actions.cooldown());
        let mut rng = EntropyScheduler::rng_for(&wallet.address, cycle);
        let (newly_stalled, outcome_row) = self
            .recorder
            .record(
                task,
                &result,
                base_cooldown,
                duration.as_millis() as u64,
                now,
                &mut rng,
            )
            .await?;
        tally.outcomes.push(outcome_row);

        metrics.record_task(duration, result.is_ok());
        if newly_stalled {
            metrics.record_stall();
            tally.report.stalled += 1;
            warn!(
                target: "cycle",
                "{} {} on {} STALLED",
                task.kind.as_str(),
                wallet.short(),
                wallet.chain
            );
        }

        match result {
            Ok(receipt) => {
                info!(
                    target: "cycle",
                    "{} {} on {} SUCCESS{}",
                    task.kind.as_str(),
                    wallet.short(),
                    wallet.chain,
                    receipt
                        .reference
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                );
                tally.report.succeeded += 1;
                Ok(Attempt::Succeeded)
            }
            Err(e) => {
                // A failed dispatch releases the day's claim so the task can
                // retry next cycle.
                self.idempotency.release(&idem_key).await?;
                if e.is_terminal_skip() {
                    debug!(
                        "{} {} skipped: {}",
                        task.kind.as_str(),
                        wallet.short(),
                        e
                    );
                    tally.report.deferred.skipped += 1;
                    metrics.record_deferral("skipped");
                } else {
                    info!(
                        target: "cycle",
                        "{} {} on {} FAILED: {}",
                        task.kind.as_str(),
                        wallet.short(),
                        wallet.chain,
                        e
                    );
                    tally.report.failed += 1;
                }
                Ok(Attempt::Failed)
            }
        }
    }

    /// Builds and runs the task future under the pool's bounds. Every
    /// external call a task makes (captcha solve, balance read, the claim or
    /// action itself) runs inside the timed future, under the per-(wallet,
    /// chain) lock.
    async fn dispatch(
        &self,
        task: &Task,
        provider: Option<&ProviderConfig>,
        now: DateTime<Utc>,
    ) -> Result<TaskReceipt, TaskError> {
        match task.kind {
            TaskKind::FaucetClaim => {
                let Some(provider) = provider else {
                    return Err(TaskError::ConfigMissing {
                        what: format!("provider config for {}", task.provider),
                    });
                };
                let ctx = self
                    .sessions
                    .context_for(&task.wallet.address, TrafficClass::Faucet, now)
                    .await?;

                self.pool
                    .run(task, async {
                        let captcha_token = match (&provider.captcha, &self.captcha) {
                            (Some(kind), Some(broker)) => {
                                let site_key = provider.site_key.as_deref().ok_or_else(|| {
                                    TaskError::ConfigMissing {
                                        what: format!("site key for provider {}", provider.name),
                                    }
                                })?;
                                Some(broker.solve(*kind, site_key, &provider.url).await?)
                            }
                            (Some(_), None) => {
                                return Err(TaskError::ConfigMissing {
                                    what: format!("captcha broker for provider {}", provider.name),
                                })
                            }
                            (None, _) => None,
                        };
                        self.faucet
                            .claim(provider, &task.wallet, &ctx, captcha_token.as_deref())
                            .await
                    })
                    .await
            }
            TaskKind::Stake => {
                let amount = self.config.actions.action_amount;
                self.pool
                    .run(task, async {
                        self.actions
                            .check_balance(self.adapter.as_ref(), &task.wallet)
                            .await?;
                        self.adapter.stake(&task.wallet, amount).await
                    })
                    .await
            }
            TaskKind::Swap => {
                let amount = self.config.actions.action_amount;
                self.pool
                    .run(task, async {
                        self.actions
                            .check_balance(self.adapter.as_ref(), &task.wallet)
                            .await?;
                        self.adapter
                            .swap(
                                &task.wallet,
                                &self.config.actions.swap_from,
                                &self.config.actions.swap_to,
                                amount,
                            )
                            .await
                    })
                    .await
            }
            TaskKind::Bridge => {
                let amount = self.config.actions.action_amount;
                self.pool
                    .run(task, async {
                        self.actions
                            .check_balance(self.adapter.as_ref(), &task.wallet)
                            .await?;
                        self.adapter
                            .bridge(
                                &task.wallet,
                                &self.config.actions.bridge_dest_chain,
                                amount,
                            )
                            .await
                    })
                    .await
            }
        }
    }

    /// Operator surface: un-park a stalled task.
    pub async fn clear_stalled(&self, task_key: &str) -> Result<()> {
        self.dead_letters.clear(task_key).await
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl DeferralCounts {
    pub fn total(&self) -> u64 {
        self.cooldown
            + self.duplicate
            + self.rate_limited
            + self.throttled
            + self.lock_contended
            + self.skipped
            + self.parked
    }
}
