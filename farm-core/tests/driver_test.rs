use async_trait::async_trait;
use chrono::Utc;
use farm_core::config::{
    FarmConfig, HttpMethod, PayloadFormat, ProviderConfig, SchedulingConfig,
};
use farm_core::driver::Driver;
use farm_core::error::TaskError;
use farm_core::store::Store;
use farm_core::traits::{
    FaucetClient, ProtocolAdapter, RequestContext, TaskReceipt,
};
use farm_core::wallet::WalletRef;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct MockAdapter {
    balance: f64,
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    async fn check_balance(&self, _wallet: &WalletRef) -> Result<f64, TaskError> {
        Ok(self.balance)
    }

    async fn stake(&self, _wallet: &WalletRef, _amount: f64) -> Result<TaskReceipt, TaskError> {
        Ok(TaskReceipt {
            reference: Some("0xstake".into()),
            amount: None,
        })
    }

    async fn swap(
        &self,
        _wallet: &WalletRef,
        _from: &str,
        _to: &str,
        _amount: f64,
    ) -> Result<TaskReceipt, TaskError> {
        Ok(TaskReceipt {
            reference: Some("0xswap".into()),
            amount: None,
        })
    }

    async fn bridge(
        &self,
        _wallet: &WalletRef,
        _dest: &str,
        _amount: f64,
    ) -> Result<TaskReceipt, TaskError> {
        Ok(TaskReceipt {
            reference: Some("0xbridge".into()),
            amount: None,
        })
    }
}

enum FaucetMode {
    Ok,
    SlowOk(Duration),
    Fail,
    RateLimit,
}

struct MockFaucet {
    mode: FaucetMode,
}

#[async_trait]
impl FaucetClient for MockFaucet {
    async fn claim(
        &self,
        provider: &ProviderConfig,
        _wallet: &WalletRef,
        _ctx: &RequestContext,
        _captcha_token: Option<&str>,
    ) -> Result<TaskReceipt, TaskError> {
        match self.mode {
            FaucetMode::Ok => Ok(TaskReceipt {
                reference: Some("req-1".into()),
                amount: Some(0.5),
            }),
            FaucetMode::SlowOk(pause) => {
                tokio::time::sleep(pause).await;
                Ok(TaskReceipt {
                    reference: Some("req-1".into()),
                    amount: Some(0.5),
                })
            }
            FaucetMode::Fail => Err(TaskError::Other("faucet 500".into())),
            FaucetMode::RateLimit => Err(TaskError::RateLimited {
                provider: provider.name.clone(),
                retry_after_secs: 60,
            }),
        }
    }
}

fn provider(name: &str, priority: u32) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        chain: "sepolia".into(),
        url: format!("https://faucet.test/{name}"),
        method: HttpMethod::Post,
        payload_format: PayloadFormat::Json,
        address_field: "address".into(),
        cooldown_hours: 24,
        daily_limit: 2,
        captcha: None,
        site_key: None,
        requires_auth: false,
        enabled: true,
        priority,
    }
}

/// All entropy layers neutralized so gating is fully deterministic.
fn flat_config(stall_threshold: u32) -> FarmConfig {
    let mut config = FarmConfig::default();
    config.scheduling = SchedulingConfig {
        off_days: vec![],
        night_lull_windows: vec![],
        daypart_windows: vec![],
        weekend_activity_reduction: 0.0,
        night_activity_reduction: 0.0,
        faucet_skip_probability: 0.0,
        action_skip_probability: 0.0,
        ..SchedulingConfig::default()
    };
    config.driver.shard_stagger = Duration::from_secs(0);
    config.driver.stall_threshold = stall_threshold;
    config.providers = vec![provider("sepoliafaucet", 1)];
    config
}

async fn driver_with(
    config: FarmConfig,
    wallets: Vec<WalletRef>,
    faucet_mode: FaucetMode,
    balance: f64,
) -> (TempDir, Arc<Driver>) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("farm.db");
    let store = Arc::new(
        Store::new(path.to_str().expect("utf8 path"))
            .await
            .expect("store init"),
    );
    let driver = Driver::new(
        config,
        wallets,
        store,
        Arc::new(MockAdapter { balance }),
        Arc::new(MockFaucet { mode: faucet_mode }),
        None,
        vec![],
        vec![],
    );
    (dir, Arc::new(driver))
}

#[tokio::test]
async fn first_cycle_claims_and_acts_for_every_wallet() {
    let wallets = vec![
        WalletRef::new("0xaaa", "sepolia", 0),
        WalletRef::new("0xbbb", "sepolia", 0),
    ];
    let (_dir, driver) = driver_with(flat_config(5), wallets, FaucetMode::Ok, 1.0).await;
    let token = CancellationToken::new();

    let report = Arc::clone(&driver)
        .run_cycle(0, Utc::now(), &token)
        .await
        .unwrap();

    // per wallet: one faucet claim plus stake, swap, bridge
    assert_eq!(report.attempted, 8);
    assert_eq!(report.succeeded, 8);
    assert_eq!(report.failed, 0);
    assert_eq!(report.stalled, 0);
}

#[tokio::test]
async fn wallets_in_a_shard_dispatch_concurrently() {
    // six wallets, each faucet claim holding for 150ms: serial execution
    // would take ~900ms, pooled execution roughly one claim's worth
    let wallets: Vec<WalletRef> = (0..6)
        .map(|i| WalletRef::new(format!("0xw{i}"), "sepolia", 0))
        .collect();
    let (_dir, driver) = driver_with(
        flat_config(5),
        wallets,
        FaucetMode::SlowOk(Duration::from_millis(150)),
        0.0,
    )
    .await;
    let token = CancellationToken::new();

    let started = std::time::Instant::now();
    let report = Arc::clone(&driver)
        .run_cycle(0, Utc::now(), &token)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.succeeded, 6);
    assert!(
        elapsed < Duration::from_millis(600),
        "cycle took {elapsed:?}, claims ran serially"
    );
}

#[tokio::test]
async fn second_cycle_defers_everything_on_cooldown() {
    let wallets = vec![WalletRef::new("0xaaa", "sepolia", 0)];
    let (_dir, driver) = driver_with(flat_config(5), wallets, FaucetMode::Ok, 1.0).await;
    let token = CancellationToken::new();
    let now = Utc::now();

    let first = Arc::clone(&driver).run_cycle(0, now, &token).await.unwrap();
    assert_eq!(first.succeeded, 4);

    let second = Arc::clone(&driver).run_cycle(1, now, &token).await.unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.deferred.cooldown, 4);
}

#[tokio::test]
async fn repeated_faucet_failures_stall_and_park_the_task() {
    let wallets = vec![WalletRef::new("0xaaa", "sepolia", 0)];
    // zero balance turns every action into a terminal skip
    let (_dir, driver) = driver_with(flat_config(2), wallets, FaucetMode::Fail, 0.0).await;
    let token = CancellationToken::new();
    let now = Utc::now();

    let c0 = Arc::clone(&driver).run_cycle(0, now, &token).await.unwrap();
    assert_eq!(c0.failed, 1);
    assert_eq!(c0.stalled, 0);
    assert_eq!(c0.deferred.skipped, 3); // stake, swap, bridge skipped on balance

    let c1 = Arc::clone(&driver).run_cycle(1, now, &token).await.unwrap();
    assert_eq!(c1.failed, 1);
    assert_eq!(c1.stalled, 1);

    // parked: the faucet task is no longer attempted
    let c2 = Arc::clone(&driver).run_cycle(2, now, &token).await.unwrap();
    assert_eq!(c2.failed, 0);
    assert_eq!(c2.deferred.parked, 1);
}

#[tokio::test]
async fn rate_limited_provider_is_backed_off_next_cycle() {
    let wallets = vec![WalletRef::new("0xaaa", "sepolia", 0)];
    let (_dir, driver) = driver_with(flat_config(5), wallets, FaucetMode::RateLimit, 1.0).await;
    let token = CancellationToken::new();
    let now = Utc::now();

    let c0 = Arc::clone(&driver).run_cycle(0, now, &token).await.unwrap();
    assert_eq!(c0.failed, 1);

    let c1 = Arc::clone(&driver).run_cycle(1, now, &token).await.unwrap();
    assert_eq!(c1.deferred.rate_limited, 1);
}

#[tokio::test]
async fn cancelled_token_stops_the_cycle_early() {
    let wallets = vec![WalletRef::new("0xaaa", "sepolia", 0)];
    let (_dir, driver) = driver_with(flat_config(5), wallets, FaucetMode::Ok, 1.0).await;
    let token = CancellationToken::new();
    token.cancel();

    let report = Arc::clone(&driver).run_cycle(0, Utc::now(), &token).await.unwrap();
    assert_eq!(report.attempted, 0);
}
