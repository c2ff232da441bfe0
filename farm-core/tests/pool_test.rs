use farm_core::error::TaskError;
use farm_core::pool::WorkerPool;
use farm_core::traits::{Task, TaskKind, TaskReceipt};
use farm_core::wallet::WalletRef;
use std::sync::Arc;
use std::time::Duration;

fn task(address: &str, chain: &str) -> Task {
    Task::new(
        TaskKind::FaucetClaim,
        WalletRef::new(address, chain, 0),
        "sepoliafaucet",
    )
}

fn ok_receipt() -> Result<TaskReceipt, TaskError> {
    Ok(TaskReceipt {
        reference: Some("0xdeadbeef".into()),
        amount: Some(0.1),
    })
}

#[tokio::test]
async fn second_task_on_same_wallet_chain_is_contended() {
    let pool = Arc::new(WorkerPool::new(8, Duration::from_secs(5)));
    let t = task("0xabc", "sepolia");

    let slow = pool.run(&t, async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ok_receipt()
    });
    let contender = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.run(&t, async { ok_receipt() }).await
    };

    let (first, second) = tokio::join!(slow, contender);
    assert!(first.is_ok());
    assert!(matches!(second, Err(TaskError::LockContended { .. })));
}

#[tokio::test]
async fn lock_is_released_after_completion() {
    let pool = WorkerPool::new(8, Duration::from_secs(5));
    let t = task("0xabc", "sepolia");

    assert!(pool.run(&t, async { ok_receipt() }).await.is_ok());
    // sequential reuse of the same (wallet, chain) slot is fine
    assert!(pool.run(&t, async { ok_receipt() }).await.is_ok());
}

#[tokio::test]
async fn lock_is_released_when_the_task_errors() {
    let pool = WorkerPool::new(8, Duration::from_secs(5));
    let t = task("0xabc", "sepolia");

    let failed = pool
        .run(&t, async { Err(TaskError::Other("boom".into())) })
        .await;
    assert!(failed.is_err());
    assert!(pool.run(&t, async { ok_receipt() }).await.is_ok());
}

#[tokio::test]
async fn different_wallets_run_concurrently() {
    let pool = Arc::new(WorkerPool::new(8, Duration::from_secs(5)));
    let a = task("0xaaa", "sepolia");
    let b = task("0xbbb", "sepolia");

    let (ra, rb) = tokio::join!(
        pool.run(&a, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ok_receipt()
        }),
        pool.run(&b, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ok_receipt()
        }),
    );
    assert!(ra.is_ok());
    assert!(rb.is_ok());
}

#[tokio::test]
async fn same_wallet_on_another_chain_is_not_contended() {
    let pool = Arc::new(WorkerPool::new(8, Duration::from_secs(5)));
    let a = task("0xabc", "sepolia");
    let b = task("0xabc", "holesky");

    let (ra, rb) = tokio::join!(
        pool.run(&a, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ok_receipt()
        }),
        pool.run(&b, async { ok_receipt() }),
    );
    assert!(ra.is_ok());
    assert!(rb.is_ok());
}

#[tokio::test]
async fn slow_task_maps_to_network_timeout() {
    let pool = WorkerPool::new(8, Duration::from_millis(50));
    let t = task("0xabc", "sepolia");

    let result = pool
        .run(&t, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ok_receipt()
        })
        .await;
    assert!(matches!(result, Err(TaskError::NetworkTimeout { .. })));
}
