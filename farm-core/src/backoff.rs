//! Per-provider rate-limit backoff.
//!
//! Each provider independently moves between `Normal` and `Backoff(n)`: the
//! n-th consecutive rate-limit signal holds the provider out for
//! `base * 2^n + jitter`, capped at `max_delay`. Any success resets to
//! `Normal`. State is in-memory only; a restart starts every provider fresh.

use crate::config::BackoffConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    strikes: u32,
    until: DateTime<Utc>,
}

pub struct ProviderBackoff {
    config: BackoffConfig,
    states: Mutex<HashMap<String, BackoffState>>,
}

impl ProviderBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining hold-out for a provider, if any.
    pub fn check(&self, provider: &str, now: DateTime<Utc>) -> Option<Duration> {
        let states = self.states.lock().ok()?;
        let state = states.get(provider)?;
        let remaining = state.until.signed_duration_since(now);
        if remaining > ChronoDuration::zero() {
            Some(Duration::from_millis(
                remaining.num_milliseconds().max(0) as u64
            ))
        } else {
            None
        }
    }

    /// Deterministic part of the hold-out after the n-th consecutive
    /// signal: `base * 2^n`, capped.
    pub fn base_delay_for_strike(&self, strikes: u32) -> Duration {
        let exp = strikes.min(16);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Registers a rate-limit signal and returns the hold-out applied.
    /// Jitter draws from the caller's seeded RNG so the delay schedule is
    /// reproducible per (wallet, cycle).
    pub fn on_rate_limited(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Duration {
        let mut states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let strikes = states.get(provider).map(|s| s.strikes + 1).unwrap_or(1);
        let jitter = rng.gen_range(0..=self.config.jitter_ms);
        let delay_ms = (self.base_delay_for_strike(strikes).as_millis() as u64)
            .saturating_add(jitter)
            .min(self.config.max_delay_ms);
        let delay = Duration::from_millis(delay_ms);

        let until = now + ChronoDuration::milliseconds(delay_ms as i64);
        states.insert(provider.to_string(), BackoffState { strikes, until });

        warn!(
            "Provider {} rate limited (strike {}), backing off {:.1}s",
            provider,
            strikes,
            delay.as_secs_f64()
        );
        delay
    }

    /// A successful call clears the provider back to `Normal`.
    pub fn on_success(&self, provider: &str) {
        let mut states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if states.remove(provider).is_some() {
            debug!("Provider {} backoff reset after success", provider);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::EntropyScheduler;

    fn backoff_with_jitter(jitter_ms: u64) -> ProviderBackoff {
        ProviderBackoff::new(BackoffConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_ms,
        })
    }

    #[test]
    fn delay_doubles_per_consecutive_signal() {
        let b = backoff_with_jitter(0);
        assert_eq!(b.base_delay_for_strike(1), Duration::from_secs(2));
        assert_eq!(b.base_delay_for_strike(2), Duration::from_secs(4));
        assert_eq!(b.base_delay_for_strike(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let b = backoff_with_jitter(0);
        assert_eq!(b.base_delay_for_strike(30), Duration::from_secs(300));
    }

    #[test]
    fn three_signals_hold_out_at_least_eight_seconds() {
        // base 1s, zero jitter: the fourth attempt must wait >= 8s
        let b = backoff_with_jitter(0);
        let now = Utc::now();
        let mut rng = EntropyScheduler::rng_for("0xabc", 0);

        let mut applied = Duration::ZERO;
        for _ in 0..3 {
            applied = b.on_rate_limited("faucet_a", now, &mut rng);
        }
        assert!(applied >= Duration::from_secs(8));
        assert!(b.check("faucet_a", now).unwrap() >= Duration::from_secs(8));
    }

    #[test]
    fn jitter_is_deterministic_under_the_same_seed() {
        let now = Utc::now();
        let a = backoff_with_jitter(1_000);
        let b = backoff_with_jitter(1_000);

        let mut rng_a = EntropyScheduler::rng_for("0xabc", 7);
        let mut rng_b = EntropyScheduler::rng_for("0xabc", 7);
        assert_eq!(
            a.on_rate_limited("faucet_a", now, &mut rng_a),
            b.on_rate_limited("faucet_a", now, &mut rng_b)
        );
    }

    #[test]
    fn success_resets_to_normal() {
        let b = backoff_with_jitter(0);
        let now = Utc::now();
        let mut rng = EntropyScheduler::rng_for("0xabc", 0);

        b.on_rate_limited("faucet_a", now, &mut rng);
        b.on_rate_limited("faucet_a", now, &mut rng);
        b.on_success("faucet_a");
        assert!(b.check("faucet_a", now).is_none());
        // next signal starts from the first-strike delay again
        assert_eq!(
            b.on_rate_limited("faucet_a", now, &mut rng),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn providers_are_independent() {
        let b = backoff_with_jitter(0);
        let now = Utc::now();
        let mut rng = EntropyScheduler::rng_for("0xabc", 0);

        b.on_rate_limited("faucet_a", now, &mut rng);
        assert!(b.check("faucet_a", now).is_some());
        assert!(b.check("faucet_b", now).is_none());
    }
}
