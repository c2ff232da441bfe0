//! # Core Error Types
//!
//! Centralized error definitions for the farm-core crate.
//! `TaskError` classifies every way a scheduled operation can fail or be
//! deferred; the classification drives retry, dead-letter, and throttle
//! behavior downstream.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Outcome classification for a single scheduled operation.
///
/// Deferrals are not failures: a deferred task simply re-enters the pool on
/// the next cycle. Transient errors feed the backoff/throttle machinery.
/// Terminal skips are dropped for the cycle without counting as faults.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("rate limited by {provider}: retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("cooldown active until {until}")]
    CooldownActive { until: DateTime<Utc> },

    #[error("duplicate dispatch suppressed for key {key}")]
    DuplicateSuppressed { key: String },

    #[error("cohort {cohort} paused by auto-throttle: {seconds_remaining}s remaining")]
    ThrottledCohort {
        cohort: String,
        seconds_remaining: u64,
    },

    #[error("task stalled after repeated consecutive failures")]
    Stalled,

    #[error("captcha solve failed: {reason}")]
    CaptchaFailed { reason: String },

    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: f64, need: f64 },

    #[error("network timeout after {timeout_ms}ms")]
    NetworkTimeout { timeout_ms: u64 },

    #[error("missing configuration: {what}")]
    ConfigMissing { what: String },

    #[error("execution lock contended for wallet {wallet} on {chain}")]
    LockContended { wallet: String, chain: String },

    #[error("task failed: {0}")]
    Other(String),
}

impl TaskError {
    /// Silent deferrals: logged at low severity, the task re-enters the
    /// pool next cycle. Never counted as failures anywhere.
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            TaskError::CooldownActive { .. }
                | TaskError::DuplicateSuppressed { .. }
                | TaskError::ThrottledCohort { .. }
                | TaskError::LockContended { .. }
        )
    }

    /// Transient faults retried per the backoff policy; these feed the
    /// rate limiter and the auto-throttle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::RateLimited { .. }
                | TaskError::NetworkTimeout { .. }
                | TaskError::CaptchaFailed { .. }
        )
    }

    /// Terminal for this cycle: not a transient fault, so it never counts
    /// toward the dead-letter failure streak.
    pub fn is_terminal_skip(&self) -> bool {
        matches!(
            self,
            TaskError::InsufficientBalance { .. } | TaskError::ConfigMissing { .. }
        )
    }

    /// Whether this outcome advances the consecutive-failure streak.
    pub fn counts_toward_dead_letter(&self) -> bool {
        !self.is_deferral() && !self.is_terminal_skip() && !matches!(self, TaskError::Stalled)
    }

    /// Short stable label used in logs and the per-cycle report.
    pub fn reason(&self) -> &'static str {
        match self {
            TaskError::RateLimited { .. } => "rate_limited",
            TaskError::CooldownActive { .. } => "cooldown",
            TaskError::DuplicateSuppressed { .. } => "duplicate",
            TaskError::ThrottledCohort { .. } => "throttled",
            TaskError::Stalled => "stalled",
            TaskError::CaptchaFailed { .. } => "captcha_failed",
            TaskError::InsufficientBalance { .. } => "insufficient_balance",
            TaskError::NetworkTimeout { .. } => "timeout",
            TaskError::ConfigMissing { .. } => "config_missing",
            TaskError::LockContended { .. } => "lock_contended",
            TaskError::Other(_) => "error",
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },
}

/// Store operation errors. A store failure is the only condition fatal to
/// an entire run.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection pool exhausted (max: {max_size})")]
    PoolExhausted { max_size: u32 },

    #[error("Transaction failed: {msg}")]
    TransactionFailed { msg: String },

    #[error("Query returned no rows for key: {key}")]
    NotFound { key: String },

    #[error("Constraint violation: {constraint}")]
    ConstraintViolation { constraint: String },
}
