use chrono::{Duration as ChronoDuration, Utc};
use farm_core::entropy::EntropyScheduler;
use farm_core::ledger::{CooldownKey, CooldownLedger, Eligibility};
use farm_core::store::Store;
use farm_core::traits::TaskKind;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn seeded_rng() -> StdRng {
    EntropyScheduler::rng_for("0xabc", 0)
}

async fn scratch_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("farm.db");
    let store = Store::new(path.to_str().expect("utf8 path"))
        .await
        .expect("store init");
    (dir, Arc::new(store))
}

fn faucet_key() -> CooldownKey {
    CooldownKey::new(TaskKind::FaucetClaim, "sepoliafaucet", "0xabc", "sepolia")
}

#[tokio::test]
async fn unknown_key_is_ready() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.1, 0.3);
    let verdict = ledger
        .is_eligible(&faucet_key(), 1, Utc::now())
        .await
        .unwrap();
    assert_eq!(verdict, Eligibility::Ready);
}

#[tokio::test]
async fn success_extends_cooldown_into_the_jitter_band() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.1, 0.3);
    let key = faucet_key();
    let now = Utc::now();
    let base = Duration::from_secs(24 * 3600);

    let row = ledger
        .record_attempt(&key, true, base, now, &mut seeded_rng())
        .await
        .unwrap();
    let until = row.cooldown_until.expect("cooldown set on success");
    let extension = until - now.timestamp();

    // 24h base with [0.1, 0.3] slack lands in [26.4h, 31.2h]
    assert!(extension >= (26.4 * 3600.0) as i64 - 1);
    assert!(extension <= (31.2 * 3600.0) as i64 + 1);

    // 20h later: still cooling down
    let at_20h = now + ChronoDuration::hours(20);
    assert!(matches!(
        ledger.is_eligible(&key, 0, at_20h).await.unwrap(),
        Eligibility::CoolingDown { .. }
    ));

    // 32h later: past the maximum possible extension
    let at_32h = now + ChronoDuration::hours(32);
    assert_eq!(
        ledger.is_eligible(&key, 0, at_32h).await.unwrap(),
        Eligibility::Ready
    );
}

#[tokio::test]
async fn failure_never_advances_cooldown() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.1, 0.3);
    let key = faucet_key();
    let now = Utc::now();
    let base = Duration::from_secs(24 * 3600);

    let after_success = ledger
        .record_attempt(&key, true, base, now, &mut seeded_rng())
        .await
        .unwrap();
    let until_before = after_success.cooldown_until.unwrap();

    let later = now + ChronoDuration::hours(1);
    let after_failure = ledger
        .record_attempt(&key, false, base, later, &mut seeded_rng())
        .await
        .unwrap();

    assert_eq!(after_failure.cooldown_until.unwrap(), until_before);
    assert_eq!(after_failure.last_attempt_at, later.timestamp());
    assert_eq!(after_failure.last_success_at, Some(now.timestamp()));
}

#[tokio::test]
async fn cooldown_until_is_monotone_per_key() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.1, 0.3);
    let key = faucet_key();
    let now = Utc::now();

    let long = ledger
        .record_attempt(&key, true, Duration::from_secs(24 * 3600), now, &mut seeded_rng())
        .await
        .unwrap();
    // a second success with a tiny base must not pull cooldown_until back
    let short = ledger
        .record_attempt(&key, true, Duration::from_secs(60), now, &mut seeded_rng())
        .await
        .unwrap();

    assert!(short.cooldown_until.unwrap() >= long.cooldown_until.unwrap());
}

#[tokio::test]
async fn daily_limit_blocks_after_enough_successes() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.0, 0.0);
    let key = faucet_key();
    let now = Utc::now();

    // zero base cooldown isolates the daily limit
    ledger
        .record_attempt(&key, true, Duration::ZERO, now, &mut seeded_rng())
        .await
        .unwrap();
    ledger
        .record_attempt(&key, true, Duration::ZERO, now, &mut seeded_rng())
        .await
        .unwrap();

    let later = now + ChronoDuration::seconds(1);
    assert!(matches!(
        ledger.is_eligible(&key, 2, later).await.unwrap(),
        Eligibility::DailyLimitReached { requests_today: 2 }
    ));
    // a higher limit still admits the key
    assert_eq!(
        ledger.is_eligible(&key, 3, later).await.unwrap(),
        Eligibility::Ready
    );
}

#[tokio::test]
async fn keys_are_isolated_per_provider() {
    let (_dir, store) = scratch_store().await;
    let ledger = CooldownLedger::new(store, 0.1, 0.3);
    let now = Utc::now();

    ledger
        .record_attempt(&faucet_key(), true, Duration::from_secs(24 * 3600), now, &mut seeded_rng())
        .await
        .unwrap();

    let other = CooldownKey::new(TaskKind::FaucetClaim, "otherfaucet", "0xabc", "sepolia");
    assert_eq!(
        ledger.is_eligible(&other, 1, now).await.unwrap(),
        Eligibility::Ready
    );
}

#[tokio::test]
async fn slack_is_deterministic_under_the_same_seed() {
    let (_dir_a, store_a) = scratch_store().await;
    let (_dir_b, store_b) = scratch_store().await;
    let ledger_a = CooldownLedger::new(store_a, 0.1, 0.3);
    let ledger_b = CooldownLedger::new(store_b, 0.1, 0.3);
    let key = faucet_key();
    let now = Utc::now();
    let base = Duration::from_secs(24 * 3600);

    let row_a = ledger_a
        .record_attempt(&key, true, base, now, &mut seeded_rng())
        .await
        .unwrap();
    let row_b = ledger_b
        .record_attempt(&key, true, base, now, &mut seeded_rng())
        .await
        .unwrap();

    assert_eq!(row_a.cooldown_until, row_b.cooldown_until);
}
