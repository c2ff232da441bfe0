//! # Cooldown Ledger
//!
//! Persistent per-(kind, provider, wallet, chain) cooldown tracking. A
//! success extends `cooldown_until` past the provider's base cooldown by a
//! freshly sampled slack fraction; failures only touch `last_attempt_at`.
//! `cooldown_until` never moves backwards for a key.

use crate::store::{CooldownRow, Store};
use crate::traits::TaskKind;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Identity of one cooldown-tracked operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub kind: TaskKind,
    pub provider: String,
    pub wallet: String,
    pub chain: String,
}

impl CooldownKey {
    pub fn new(
        kind: TaskKind,
        provider: impl Into<String>,
        wallet: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            wallet: wallet.into(),
            chain: chain.into(),
        }
    }
}

/// Ledger verdict for a key at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Ready,
    CoolingDown { until: DateTime<Utc> },
    DailyLimitReached { requests_today: u32 },
}

pub struct CooldownLedger {
    store: Arc<Store>,
    jitter_min: f64,
    jitter_max: f64,
}

impl CooldownLedger {
    pub fn new(store: Arc<Store>, jitter_min: f64, jitter_max: f64) -> Self {
        Self {
            store,
            jitter_min,
            jitter_max,
        }
    }

    pub async fn is_eligible(
        &self,
        key: &CooldownKey,
        daily_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Eligibility> {
        let row = self
            .store
            .get_cooldown(key.kind.as_str(), &key.provider, &key.wallet, &key.chain)
            .await?;

        let Some(row) = row else {
            return Ok(Eligibility::Ready);
        };

        if let Some(until_ts) = row.cooldown_until {
            if until_ts > now.timestamp() {
                let until = Utc
                    .timestamp_opt(until_ts, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                return Ok(Eligibility::CoolingDown { until });
            }
        }

        let today = day_bucket(now);
        if daily_limit > 0 && row.request_day == today && row.requests_today >= i64::from(daily_limit)
        {
            return Ok(Eligibility::DailyLimitReached {
                requests_today: row.requests_today as u32,
            });
        }

        Ok(Eligibility::Ready)
    }

    /// Records an attempt outcome. On success the next `cooldown_until` is
    /// `now + base_cooldown * (1 + slack)` with slack resampled from
    /// `[jitter_min, jitter_max]` out of the caller's seeded RNG, clamped to
    /// never shrink the stored value. Returns the row as written.
    pub async fn record_attempt(
        &self,
        key: &CooldownKey,
        success: bool,
        base_cooldown: Duration,
        now: DateTime<Utc>,
        rng: &mut (impl Rng + Send),
    ) -> Result<CooldownRow> {
        let existing = self
            .store
            .get_cooldown(key.kind.as_str(), &key.provider, &key.wallet, &key.chain)
            .await?;

        let today = day_bucket(now);
        let mut row = existing.unwrap_or_else(|| CooldownRow {
            kind: key.kind.as_str().to_string(),
            provider: key.provider.clone(),
            wallet: key.wallet.clone(),
            chain: key.chain.clone(),
            last_attempt_at: now.timestamp(),
            last_success_at: None,
            cooldown_until: None,
            requests_today: 0,
            request_day: today.clone(),
        });

        row.last_attempt_at = now.timestamp();

        if success {
            row.last_success_at = Some(now.timestamp());

            let slack = rng.gen_range(self.jitter_min..=self.jitter_max);
            let extended = base_cooldown.as_secs_f64() * (1.0 + slack);
            let candidate = now.timestamp() + extended.round() as i64;
            row.cooldown_until = Some(match row.cooldown_until {
                Some(prev) => prev.max(candidate),
                None => candidate,
            });

            if row.request_day == today {
                row.requests_today += 1;
            } else {
                row.request_day = today;
                row.requests_today = 1;
            }
        }

        self.store.upsert_cooldown(&row).await?;
        Ok(row)
    }
}

/// UTC day bucket, `YYYY-MM-DD`.
pub fn day_bucket(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}
