//! Cohort-level circuit breaking.
//!
//! Every task outcome is recorded into a sliding window per cohort (one
//! cohort per shard). When the windowed error rate crosses the threshold
//! with enough samples, the whole cohort pauses. Re-triggering shortly after
//! a pause expires doubles the next pause up to a cap; sustained clean
//! windows halve it back toward the base.

use crate::config::ThrottleConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct CohortState {
    window: VecDeque<(DateTime<Utc>, bool)>,
    paused_until: Option<DateTime<Utc>>,
    current_pause: Option<Duration>,
    last_pause_expired: Option<DateTime<Utc>>,
}

pub struct AutoThrottle {
    config: ThrottleConfig,
    cohorts: Mutex<HashMap<String, CohortState>>,
    pub throttle_events: AtomicU64,
}

impl AutoThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            cohorts: Mutex::new(HashMap::new()),
            throttle_events: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CohortState>> {
        match self.cohorts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn prune(window: &mut VecDeque<(DateTime<Utc>, bool)>, horizon: DateTime<Utc>) {
        while window.front().is_some_and(|(t, _)| *t < horizon) {
            window.pop_front();
        }
    }

    fn windowed_rate(state: &CohortState) -> (usize, f64) {
        let total = state.window.len();
        if total == 0 {
            return (0, 0.0);
        }
        let errors = state.window.iter().filter(|(_, ok)| !ok).count();
        (total, errors as f64 / total as f64)
    }

    /// Feeds one task outcome into the cohort window and trips the pause
    /// when the error rate crosses the threshold with enough samples.
    pub fn record_outcome(&self, cohort: &str, success: bool, now: DateTime<Utc>) {
        let window_span = ChronoDuration::from_std(self.config.window)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));

        let mut cohorts = self.lock();
        let state = cohorts.entry(cohort.to_string()).or_default();

        Self::prune(&mut state.window, now - window_span);
        state.window.push_back((now, success));

        if let Some(until) = state.paused_until {
            if until > now {
                return;
            }
            // the pause lapsed between polls; record the expiry here too so
            // escalation does not depend on an is_paused call in between
            state.paused_until = None;
            state.last_pause_expired = Some(until);
        }

        let (samples, rate) = Self::windowed_rate(state);
        if samples < self.config.min_samples || rate < self.config.error_threshold {
            return;
        }

        let pause = self.next_pause(state, now, window_span);
        state.current_pause = Some(pause);
        state.paused_until = Some(now + ChronoDuration::milliseconds(pause.as_millis() as i64));
        self.throttle_events.fetch_add(1, Ordering::SeqCst);

        warn!(
            "Cohort {} paused for {:.0}s (error rate {:.0}% over {} samples)",
            cohort,
            pause.as_secs_f64(),
            rate * 100.0,
            samples
        );
    }

    /// Escalate when the previous pause expired less than one clean window
    /// ago; otherwise halve back toward the base per elapsed clean window.
    fn next_pause(
        &self,
        state: &CohortState,
        now: DateTime<Utc>,
        window_span: ChronoDuration,
    ) -> Duration {
        let base = self.config.base_pause;
        let Some(prev) = state.current_pause else {
            return base;
        };
        let Some(expired_at) = state.last_pause_expired else {
            return base;
        };

        let clean = now.signed_duration_since(expired_at);
        if clean < window_span {
            return (prev * 2).min(self.config.max_pause);
        }

        let halvings = (clean.num_seconds() / window_span.num_seconds().max(1)) as u32;
        let mut decayed = prev;
        for _ in 0..halvings.min(16) {
            decayed /= 2;
            if decayed <= base {
                return base;
            }
        }
        decayed.max(base)
    }

    /// Remaining pause for the cohort, if any. Expiry is recorded lazily.
    pub fn is_paused(&self, cohort: &str, now: DateTime<Utc>) -> Option<Duration> {
        let mut cohorts = self.lock();
        let state = cohorts.get_mut(cohort)?;
        let until = state.paused_until?;
        let remaining = until.signed_duration_since(now);
        if remaining > ChronoDuration::zero() {
            Some(Duration::from_millis(
                remaining.num_milliseconds().max(0) as u64
            ))
        } else {
            state.paused_until = None;
            state.last_pause_expired = Some(until);
            None
        }
    }

    /// Windowed error rate, when enough samples exist to mean anything.
    pub fn error_rate(&self, cohort: &str, now: DateTime<Utc>) -> Option<f64> {
        let window_span = ChronoDuration::from_std(self.config.window)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let mut cohorts = self.lock();
        let state = cohorts.get_mut(cohort)?;
        Self::prune(&mut state.window, now - window_span);
        let (samples, rate) = Self::windowed_rate(state);
        (samples >= self.config.min_samples).then_some(rate)
    }

    /// Delay multiplier for a cohort running hot but not (yet) paused.
    pub fn slowdown_factor(&self, cohort: &str, now: DateTime<Utc>) -> f64 {
        match self.error_rate(cohort, now) {
            Some(rate) if rate >= self.config.error_threshold => self.config.slowdown_factor,
            _ => 1.0,
        }
    }

    /// Operator action: clear all throttle state for a cohort.
    pub fn reset(&self, cohort: &str) {
        let mut cohorts = self.lock();
        if cohorts.remove(cohort).is_some() {
            info!("Cohort {} throttle state reset", cohort);
        }
    }
}
