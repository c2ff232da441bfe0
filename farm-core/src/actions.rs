//! On-chain action scheduling on top of the shared gating machinery.
//!
//! Actions reuse the same ledger/idempotency/backoff path as faucet claims;
//! this module adds the per-wallet daily cap, the deterministic per-day
//! ordering of action kinds, and the pre-flight balance check.

use crate::config::ActionConfig;
use crate::error::TaskError;
use crate::ledger::day_bucket;
use crate::store::Store;
use crate::traits::{ProtocolAdapter, TaskKind};
use crate::wallet::WalletRef;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub struct ActionScheduler {
    store: Arc<Store>,
    config: ActionConfig,
}

impl ActionScheduler {
    pub fn new(store: Arc<Store>, config: ActionConfig) -> Self {
        Self { store, config }
    }

    /// Action kinds for one cycle, shuffled deterministically per
    /// (shard, UTC day) so a shard's wallets execute kinds in a stable but
    /// day-varying order.
    pub fn ordered_kinds(shard_id: u32, at: DateTime<Utc>) -> Vec<TaskKind> {
        let digest =
            Sha256::digest(format!("shard:{}:{}", shard_id, day_bucket(at)).as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));

        let mut kinds = TaskKind::ACTIONS.to_vec();
        kinds.shuffle(&mut rng);
        kinds
    }

    /// Successful actions the wallet may still run today. The caller owns
    /// decrementing for successes not yet flushed to the task log.
    pub async fn remaining_daily_allowance(
        &self,
        wallet: &WalletRef,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc().timestamp())
            .unwrap_or_else(|| now.timestamp());
        let count = self
            .store
            .count_successful_actions_since(&wallet.address, midnight)
            .await?;
        Ok(self.config.daily_action_cap.saturating_sub(count.max(0) as u32))
    }

    /// Pre-flight: an action with nothing to move is a terminal skip for
    /// the cycle, not a failure.
    pub async fn check_balance(
        &self,
        adapter: &dyn ProtocolAdapter,
        wallet: &WalletRef,
    ) -> Result<f64, TaskError> {
        let have = adapter.check_balance(wallet).await?;
        if have < self.config.min_stake_balance {
            return Err(TaskError::InsufficientBalance {
                have,
                need: self.config.min_stake_balance,
            });
        }
        Ok(have)
    }
}
