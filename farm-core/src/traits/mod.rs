//! Trait seams for external collaborators and the task vocabulary shared by
//! every scheduling component.
//!
//! The engine never talks to a chain, a signer, a captcha service, or a
//! faucet endpoint directly: each sits behind an object-safe async trait so
//! the scheduler stays chain-family agnostic and fully testable in-process.

use crate::config::{CaptchaKind, ProviderConfig};
use crate::error::TaskError;
use crate::wallet::WalletRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kinds of operations the engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FaucetClaim,
    Stake,
    Swap,
    Bridge,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::FaucetClaim => "faucet_claim",
            TaskKind::Stake => "stake",
            TaskKind::Swap => "swap",
            TaskKind::Bridge => "bridge",
        }
    }

    pub fn is_action(&self) -> bool {
        !matches!(self, TaskKind::FaucetClaim)
    }

    /// On-chain action kinds, in canonical order.
    pub const ACTIONS: [TaskKind; 3] = [TaskKind::Stake, TaskKind::Swap, TaskKind::Bridge];
}

/// One unit of schedulable work: a (kind, wallet, provider) triple.
///
/// For on-chain actions `provider` carries the protocol name so cooldown
/// keys stay uniform across both task families.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub wallet: WalletRef,
    pub provider: String,
}

impl Task {
    pub fn new(kind: TaskKind, wallet: WalletRef, provider: impl Into<String>) -> Self {
        Self {
            kind,
            wallet,
            provider: provider.into(),
        }
    }

    /// Cohort label for throttle grouping: tasks sharing a shard share fate.
    pub fn cohort(&self) -> String {
        format!("shard_{}", self.wallet.shard_id)
    }
}

/// Successful completion of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReceipt {
    /// Transaction hash or provider-reported request id, when available.
    pub reference: Option<String>,
    pub amount: Option<f64>,
}

/// Network context a task executes under: sticky proxy plus browser headers.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub proxy_url: Option<String>,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
}

/// Opaque signature produced by the key provider.
#[derive(Debug, Clone)]
pub struct Signature(pub Vec<u8>);

/// Chain-family specific execution of on-chain actions. Implementations
/// exist per chain family (EVM, Solana, ...); the scheduler never branches
/// on which one it holds.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Native balance of the wallet, in whole units.
    async fn check_balance(&self, wallet: &WalletRef) -> Result<f64, TaskError>;

    async fn stake(&self, wallet: &WalletRef, amount: f64) -> Result<TaskReceipt, TaskError>;

    async fn swap(
        &self,
        wallet: &WalletRef,
        from_token: &str,
        to_token: &str,
        amount: f64,
    ) -> Result<TaskReceipt, TaskError>;

    async fn bridge(
        &self,
        wallet: &WalletRef,
        dest_chain: &str,
        amount: f64,
    ) -> Result<TaskReceipt, TaskError>;
}

/// Signing seam. Raw key material never crosses this boundary.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn sign(&self, wallet: &WalletRef, payload: &[u8]) -> Result<Signature, TaskError>;
}

/// External captcha solving service.
#[async_trait]
pub trait CaptchaBroker: Send + Sync {
    async fn solve(
        &self,
        kind: CaptchaKind,
        site_key: &str,
        page_url: &str,
    ) -> Result<String, TaskError>;
}

/// Performs the actual faucet HTTP request under a prepared session context.
#[async_trait]
pub trait FaucetClient: Send + Sync {
    async fn claim(
        &self,
        provider: &ProviderConfig,
        wallet: &WalletRef,
        ctx: &RequestContext,
        captcha_token: Option<&str>,
    ) -> Result<TaskReceipt, TaskError>;
}
