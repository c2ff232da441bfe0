use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{ConfigError, StoreError};
use smallvec::SmallVec;

/// Persistent state shared by the ledger, the idempotency guard, the
/// dead-letter tracker and the session broker. SQLite in WAL mode; every
/// other component treats this as its single source of durable truth.
///
/// Not Clone; use `Arc<Store>` for shared ownership.
#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
    metrics: Arc<DbMetrics>,
}

#[derive(Debug, Default)]
pub struct DbMetrics {
    pub total_queries: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_inserts: AtomicU64,
    pub total_selects: AtomicU64,
    pub avg_query_time_ms: AtomicU64,
    pub query_count_for_avg: AtomicU64,
}

/// One row of the `cooldowns` table. Timestamps are unix seconds;
/// `request_day` is the UTC day bucket the `requests_today` counter belongs
/// to, so stale counters read as zero without a midnight sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CooldownRow {
    pub kind: String,
    pub provider: String,
    pub wallet: String,
    pub chain: String,
    pub last_attempt_at: i64,
    pub last_success_at: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub requests_today: i64,
    pub request_day: String,
}

/// One row of the `dead_letters` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub task_key: String,
    pub failure_streak: i64,
    pub last_error: Option<String>,
    pub stalled_since: Option<i64>,
    pub updated_at: i64,
}

/// Sticky proxy assignment for one (wallet, traffic class) pair.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProxyAssignmentRow {
    pub wallet: String,
    pub traffic_class: String,
    pub proxy_url: String,
    pub sticky_until: i64,
}

#[derive(Debug, Clone)]
pub struct OutcomeBatchItem {
    pub wallet: String,
    pub chain: String,
    pub kind: String,
    pub provider: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl Store {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn new(db_path: &str) -> Result<Self> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| ConfigError::IoError {
                path: db_path.to_string(),
                msg: e.to_string(),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| StoreError::TransactionFailed { msg: e.to_string() })?;

        let store = Self {
            pool,
            metrics: Arc::new(DbMetrics::default()),
        };
        store.init_schema().await?;
        info!(
            "Store initialized with pool size {} (WAL mode)",
            Self::DEFAULT_MAX_CONNECTIONS
        );
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|_| StoreError::PoolExhausted {
                max_size: Self::DEFAULT_MAX_CONNECTIONS,
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cooldowns (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                provider TEXT NOT NULL,
                wallet TEXT NOT NULL,
                chain TEXT NOT NULL,
                last_attempt_at INTEGER NOT NULL,
                last_success_at INTEGER,
                cooldown_until INTEGER,
                requests_today INTEGER NOT NULL DEFAULT 0,
                request_day TEXT NOT NULL DEFAULT '',
                UNIQUE(kind, provider, wallet, chain)
            );
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                id INTEGER PRIMARY KEY,
                key_hash TEXT UNIQUE NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY,
                task_key TEXT UNIQUE NOT NULL,
                failure_streak INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                stalled_since INTEGER,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS proxy_assignments (
                id INTEGER PRIMARY KEY,
                wallet TEXT NOT NULL,
                traffic_class TEXT NOT NULL,
                proxy_url TEXT NOT NULL,
                sticky_until INTEGER NOT NULL,
                UNIQUE(wallet, traffic_class)
            );
            CREATE TABLE IF NOT EXISTS task_log (
                id INTEGER PRIMARY KEY,
                wallet TEXT,
                chain TEXT,
                kind TEXT,
                provider TEXT,
                status TEXT,
                message TEXT,
                duration_ms INTEGER,
                timestamp INTEGER
            );",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::TransactionFailed { msg: e.to_string() })?;

        self.create_indexes().await?;

        info!("Store schema initialized with indexes.");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_cooldowns_wallet ON cooldowns(wallet, chain);",
            "CREATE INDEX IF NOT EXISTS idx_cooldowns_until ON cooldowns(cooldown_until);",
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_stalled ON dead_letters(stalled_since);",
            "CREATE INDEX IF NOT EXISTS idx_task_log_wallet ON task_log(wallet);",
            "CREATE INDEX IF NOT EXISTS idx_task_log_timestamp ON task_log(timestamp);",
        ];

        for idx_sql in indexes {
            if let Err(e) = sqlx::query(idx_sql).execute(&self.pool).await {
                debug!("Index creation skipped (may exist): {}", e);
            }
        }
        Ok(())
    }

    // ---- cooldowns ----

    pub async fn get_cooldown(
        &self,
        kind: &str,
        provider: &str,
        wallet: &str,
        chain: &str,
    ) -> Result<Option<CooldownRow>> {
        let start = std::time::Instant::now();

        let row = sqlx::query_as::<_, CooldownRow>(
            "SELECT kind, provider, wallet, chain, last_attempt_at, last_success_at, cooldown_until, requests_today, request_day
             FROM cooldowns WHERE kind = ? AND provider = ? AND wallet = ? AND chain = ?",
        )
        .bind(kind)
        .bind(provider)
        .bind(wallet)
        .bind(chain)
        .fetch_optional(&self.pool)
        .await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, row.is_ok());

        match row {
            Ok(row) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(row)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to read cooldown row")
            }
        }
    }

    pub async fn upsert_cooldown(&self, row: &CooldownRow) -> Result<()> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "INSERT INTO cooldowns (kind, provider, wallet, chain, last_attempt_at, last_success_at, cooldown_until, requests_today, request_day)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(kind, provider, wallet, chain) DO UPDATE SET
                 last_attempt_at = excluded.last_attempt_at,
                 last_success_at = excluded.last_success_at,
                 cooldown_until = excluded.cooldown_until,
                 requests_today = excluded.requests_today,
                 request_day = excluded.request_day",
        )
        .bind(&row.kind)
        .bind(&row.provider)
        .bind(&row.wallet)
        .bind(&row.chain)
        .bind(row.last_attempt_at)
        .bind(row.last_success_at)
        .bind(row.cooldown_until)
        .bind(row.requests_today)
        .bind(&row.request_day)
        .execute(&self.pool)
        .await;

        self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, result.is_ok());

        match result {
            Ok(_) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Failed to upsert cooldown: {}", e);
                Err(e).context("Failed to upsert cooldown")
            }
        }
    }

    // ---- idempotency ----

    /// Atomic check-and-insert: true means this call claimed the key, false
    /// means some earlier dispatch already holds it.
    pub async fn try_insert_idempotency_key(&self, key_hash: &str, now_ts: i64) -> Result<bool> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO idempotency_keys (key_hash, created_at) VALUES (?, ?)",
        )
        .bind(key_hash)
        .bind(now_ts)
        .execute(&self.pool)
        .await;

        self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, result.is_ok());

        match result {
            Ok(done) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(done.rows_affected() == 1)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Failed to claim idempotency key: {}", e);
                Err(e).context("Failed to claim idempotency key")
            }
        }
    }

    /// Releases a claimed key so the operation can be retried within the
    /// same day bucket after a failed dispatch.
    pub async fn release_idempotency_key(&self, key_hash: &str) -> Result<()> {
        let start = std::time::Instant::now();

        let result = sqlx::query("DELETE FROM idempotency_keys WHERE key_hash = ?")
            .bind(key_hash)
            .execute(&self.pool)
            .await;

        self.record_query_time(start, result.is_ok());

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to release idempotency key")
            }
        }
    }

    // ---- dead letters ----

    pub async fn get_dead_letter(&self, task_key: &str) -> Result<Option<DeadLetterRow>> {
        let start = std::time::Instant::now();

        let row = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT task_key, failure_streak, last_error, stalled_since, updated_at
             FROM dead_letters WHERE task_key = ?",
        )
        .bind(task_key)
        .fetch_optional(&self.pool)
        .await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, row.is_ok());

        match row {
            Ok(row) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(row)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to read dead letter row")
            }
        }
    }

    pub async fn upsert_dead_letter(&self, row: &DeadLetterRow) -> Result<()> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "INSERT INTO dead_letters (task_key, failure_streak, last_error, stalled_since, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(task_key) DO UPDATE SET
                 failure_streak = excluded.failure_streak,
                 last_error = excluded.last_error,
                 stalled_since = excluded.stalled_since,
                 updated_at = excluded.updated_at",
        )
        .bind(&row.task_key)
        .bind(row.failure_streak)
        .bind(&row.last_error)
        .bind(row.stalled_since)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await;

        self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, result.is_ok());

        match result {
            Ok(_) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Failed to upsert dead letter: {}", e);
                Err(e).context("Failed to upsert dead letter")
            }
        }
    }

    pub async fn delete_dead_letter(&self, task_key: &str) -> Result<()> {
        let start = std::time::Instant::now();

        let result = sqlx::query("DELETE FROM dead_letters WHERE task_key = ?")
            .bind(task_key)
            .execute(&self.pool)
            .await;

        self.record_query_time(start, result.is_ok());

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to delete dead letter")
            }
        }
    }

    pub async fn list_stalled(&self) -> Result<Vec<DeadLetterRow>> {
        let start = std::time::Instant::now();

        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT task_key, failure_streak, last_error, stalled_since, updated_at
             FROM dead_letters WHERE stalled_since IS NOT NULL ORDER BY stalled_since ASC",
        )
        .fetch_all(&self.pool)
        .await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, rows.is_ok());

        match rows {
            Ok(rows) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(rows)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to list stalled tasks")
            }
        }
    }

    // ---- proxy assignments ----

    pub async fn get_proxy_assignment(
        &self,
        wallet: &str,
        traffic_class: &str,
    ) -> Result<Option<ProxyAssignmentRow>> {
        let start = std::time::Instant::now();

        let row = sqlx::query_as::<_, ProxyAssignmentRow>(
            "SELECT wallet, traffic_class, proxy_url, sticky_until
             FROM proxy_assignments WHERE wallet = ? AND traffic_class = ?",
        )
        .bind(wallet)
        .bind(traffic_class)
        .fetch_optional(&self.pool)
        .await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, row.is_ok());

        match row {
            Ok(row) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(row)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to read proxy assignment")
            }
        }
    }

    pub async fn put_proxy_assignment(&self, row: &ProxyAssignmentRow) -> Result<()> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "INSERT INTO proxy_assignments (wallet, traffic_class, proxy_url, sticky_until)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(wallet, traffic_class) DO UPDATE SET
                 proxy_url = excluded.proxy_url,
                 sticky_until = excluded.sticky_until",
        )
        .bind(&row.wallet)
        .bind(&row.traffic_class)
        .bind(&row.proxy_url)
        .bind(row.sticky_until)
        .execute(&self.pool)
        .await;

        self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, result.is_ok());

        match result {
            Ok(_) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Failed to store proxy assignment: {}", e);
                Err(e).context("Failed to store proxy assignment")
            }
        }
    }

    // ---- task log ----

    /// Batch insert outcomes in a single transaction at cycle end.
    pub async fn batch_log_outcomes(&self, items: &[OutcomeBatchItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        // Stack allocation for the common per-cycle batch size
        type BatchRow = (String, String, String, String, String, String, i64, i64);
        let mut rows: SmallVec<[BatchRow; 32]> = SmallVec::new();

        let timestamp = chrono::Utc::now().timestamp();

        for item in items {
            let status = if item.success { "SUCCESS" } else { "FAILED" };
            rows.push((
                item.wallet.clone(),
                item.chain.clone(),
                item.kind.clone(),
                item.provider.clone(),
                status.to_string(),
                item.message.clone(),
                item.duration_ms as i64,
                timestamp,
            ));
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in &rows {
            let result = sqlx::query(
                "INSERT INTO task_log (wallet, chain, kind, provider, status, message, duration_ms, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            )
            .bind(&row.0)
            .bind(&row.1)
            .bind(&row.2)
            .bind(&row.3)
            .bind(&row.4)
            .bind(&row.5)
            .bind(row.6)
            .bind(row.7)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {
                    inserted += 1;
                    self.metrics.total_inserts.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => {
                    self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        tx.commit().await?;

        self.metrics
            .total_queries
            .fetch_add(items.len() as u64, Ordering::SeqCst);

        Ok(inserted)
    }

    /// Successful on-chain actions for a wallet since `since_ts` (any kind
    /// except faucet claims). Backs the daily action cap.
    pub async fn count_successful_actions_since(
        &self,
        wallet: &str,
        since_ts: i64,
    ) -> Result<i32> {
        let start = std::time::Instant::now();

        let row = sqlx::query_as::<_, (i32,)>(
            "SELECT COUNT(*) FROM task_log
             WHERE wallet = ? AND kind != 'faucet_claim' AND status = 'SUCCESS' AND timestamp >= ?",
        )
        .bind(wallet)
        .bind(since_ts)
        .fetch_one(&self.pool)
        .await;

        self.metrics.total_selects.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, row.is_ok());

        match row {
            Ok((count,)) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(count)
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                Err(e).context("Failed to count actions")
            }
        }
    }

    pub fn get_metrics(&self) -> DbMetricsSnapshot {
        DbMetricsSnapshot {
            total_queries: self.metrics.total_queries.load(Ordering::SeqCst),
            total_errors: self.metrics.total_errors.load(Ordering::SeqCst),
            total_inserts: self.metrics.total_inserts.load(Ordering::SeqCst),
            total_selects: self.metrics.total_selects.load(Ordering::SeqCst),
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn record_query_time(&self, start: std::time::Instant, success: bool) {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let count = self.metrics.query_count_for_avg.load(Ordering::SeqCst);
        let current_avg = self.metrics.avg_query_time_ms.load(Ordering::SeqCst);

        if success {
            let new_count = count + 1;
            let new_avg = if count == 0 {
                elapsed_ms
            } else {
                (current_avg * count + elapsed_ms) / new_count
            };
            self.metrics
                .query_count_for_avg
                .store(new_count, Ordering::SeqCst);
            self.metrics
                .avg_query_time_ms
                .store(new_avg, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbMetricsSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_inserts: u64,
    pub total_selects: u64,
}

impl DbMetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_queries as f64 * 100.0
        }
    }
}
