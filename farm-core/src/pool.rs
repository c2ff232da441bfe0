//! # Worker Pool
//!
//! Bounded execution of scheduled tasks. A semaphore caps global
//! concurrency, an in-flight set guarantees at most one task per
//! (wallet, chain) at a time, and every external call runs under a hard
//! timeout. `OutcomeRecorder` is the single place a finished task updates
//! ledger, backoff, throttle and dead-letter state.

use crate::backoff::ProviderBackoff;
use crate::deadletter::DeadLetterTracker;
use crate::error::TaskError;
use crate::ledger::{CooldownKey, CooldownLedger};
use crate::store::OutcomeBatchItem;
use crate::throttle::AutoThrottle;
use crate::traits::{Task, TaskReceipt};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

type FlightKey = (String, String);

/// Releases the (wallet, chain) slot when dropped, so the lock survives
/// early returns and panics inside the task future.
struct FlightGuard {
    in_flight: Arc<Mutex<HashSet<FlightKey>>>,
    key: FlightKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut set = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.key);
    }
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<FlightKey>>>,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize, task_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            task_timeout,
        }
    }

    fn try_lock(&self, wallet: &str, chain: &str) -> Option<FlightGuard> {
        let key = (wallet.to_string(), chain.to_string());
        let mut set = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.insert(key.clone()) {
            Some(FlightGuard {
                in_flight: Arc::clone(&self.in_flight),
                key,
            })
        } else {
            None
        }
    }

    /// Runs one task future under the pool's bounds. Contention on the
    /// (wallet, chain) slot is a deferral; timeout maps to `NetworkTimeout`.
    pub async fn run<F>(&self, task: &Task, fut: F) -> Result<TaskReceipt, TaskError>
    where
        F: Future<Output = Result<TaskReceipt, TaskError>>,
    {
        let Some(_guard) = self.try_lock(&task.wallet.address, &task.wallet.chain) else {
            return Err(TaskError::LockContended {
                wallet: task.wallet.address.clone(),
                chain: task.wallet.chain.clone(),
            });
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TaskError::Other("worker pool closed".to_string()))?;

        debug!(
            "Dispatching {} for {} on {}",
            task.kind.as_str(),
            task.wallet.short(),
            task.wallet.chain
        );

        match tokio::time::timeout(self.task_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::NetworkTimeout {
                timeout_ms: self.task_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Applies one finished task outcome to every stateful component in a
/// single logical step. Deferrals never reach this point.
pub struct OutcomeRecorder {
    pub ledger: Arc<CooldownLedger>,
    pub backoff: Arc<ProviderBackoff>,
    pub throttle: Arc<AutoThrottle>,
    pub dead_letter: Arc<DeadLetterTracker>,
}

impl OutcomeRecorder {
    /// Returns whether this outcome newly stalled the task, plus the log
    /// row for the cycle-end batch insert. Jitter draws (cooldown slack,
    /// backoff jitter) come from the caller's seeded RNG.
    pub async fn record(
        &self,
        task: &Task,
        result: &Result<TaskReceipt, TaskError>,
        base_cooldown: Duration,
        duration_ms: u64,
        now: DateTime<Utc>,
        rng: &mut (impl Rng + Send),
    ) -> Result<(bool, OutcomeBatchItem)> {
        let success = result.is_ok();
        let key = CooldownKey::new(
            task.kind,
            &task.provider,
            &task.wallet.address,
            &task.wallet.chain,
        );

        self.ledger
            .record_attempt(&key, success, base_cooldown, now, rng)
            .await?;

        match result {
            Ok(_) => self.backoff.on_success(&task.provider),
            Err(TaskError::RateLimited { .. }) => {
                self.backoff.on_rate_limited(&task.provider, now, rng);
            }
            Err(_) => {}
        }

        self.throttle.record_outcome(&task.cohort(), success, now);

        let message = match result {
            Ok(receipt) => receipt.reference.clone().unwrap_or_default(),
            Err(e) => e.to_string(),
        };

        let mut newly_stalled = false;
        let advances_streak = match result {
            Ok(_) => true,
            Err(e) => e.counts_toward_dead_letter(),
        };
        if advances_streak {
            let task_key = DeadLetterTracker::task_key(
                task.kind.as_str(),
                &task.provider,
                &task.wallet.address,
                &task.wallet.chain,
            );
            newly_stalled = self
                .dead_letter
                .record_outcome(&task_key, success, (!success).then_some(message.as_str()), now)
                .await?;
        }

        let item = OutcomeBatchItem {
            wallet: task.wallet.address.clone(),
            chain: task.wallet.chain.clone(),
            kind: task.kind.as_str().to_string(),
            provider: task.provider.clone(),
            success,
            message,
            duration_ms,
        };

        Ok((newly_stalled, item))
    }
}
