//! # farm-core
//!
//! Orchestration and anti-detection scheduling engine for rate-limited
//! testnet operations across a large wallet fleet. The crate schedules
//! faucet claims and on-chain eligibility actions under persistent
//! cooldowns, duplicate suppression, per-provider backoff, cohort
//! throttling, human-pattern timing entropy, and sticky network identities.
//!
//! Chain execution, signing, and captcha solving live behind the traits in
//! [`traits`]; everything in this crate is the scheduling machinery around
//! them.

pub mod actions;
pub mod backoff;
pub mod config;
pub mod deadletter;
pub mod driver;
pub mod entropy;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod logger;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod store;
pub mod throttle;
pub mod traits;
pub mod wallet;

pub use actions::ActionScheduler;
pub use backoff::ProviderBackoff;
pub use config::FarmConfig;
pub use deadletter::DeadLetterTracker;
pub use driver::{CycleReport, Driver};
pub use entropy::{Decision, EntropyScheduler, ScheduleKind};
pub use error::{ConfigError, StoreError, TaskError};
pub use idempotency::IdempotencyGuard;
pub use ledger::{CooldownKey, CooldownLedger, Eligibility};
pub use metrics::MetricsCollector;
pub use pool::{OutcomeRecorder, WorkerPool};
pub use session::{SessionBroker, TrafficClass};
pub use store::Store;
pub use throttle::AutoThrottle;
pub use traits::{
    CaptchaBroker, FaucetClient, KeyProvider, ProtocolAdapter, RequestContext, Task, TaskKind,
    TaskReceipt,
};
pub use wallet::WalletRef;
