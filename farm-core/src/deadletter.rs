//! Dead-letter tracking for structurally broken work.
//!
//! Consecutive real failures (deferrals and terminal skips excluded) grow a
//! streak; at the threshold the task is marked stalled and the scheduler
//! stops attempting it. A later success resets the streak but never clears
//! the stall: that requires an explicit operator `clear`, since a task that
//! stalled once usually points at broken config or a dead endpoint.

use crate::store::{DeadLetterRow, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub struct DeadLetterTracker {
    store: Arc<Store>,
    stall_threshold: u32,
}

impl DeadLetterTracker {
    pub const DEFAULT_STALL_THRESHOLD: u32 = 5;

    pub fn new(store: Arc<Store>, stall_threshold: u32) -> Self {
        Self {
            store,
            stall_threshold: stall_threshold.max(1),
        }
    }

    /// Stable key for one schedulable unit.
    pub fn task_key(kind: &str, provider: &str, wallet: &str, chain: &str) -> String {
        format!("{}:{}:{}:{}", kind, provider, wallet, chain)
    }

    pub async fn is_stalled(&self, task_key: &str) -> Result<bool> {
        Ok(self
            .store
            .get_dead_letter(task_key)
            .await?
            .is_some_and(|row| row.stalled_since.is_some()))
    }

    /// Feeds one real outcome into the streak. Returns true when this
    /// outcome crossed the stall threshold.
    pub async fn record_outcome(
        &self,
        task_key: &str,
        success: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let existing = self.store.get_dead_letter(task_key).await?;

        let mut row = existing.unwrap_or_else(|| DeadLetterRow {
            task_key: task_key.to_string(),
            failure_streak: 0,
            last_error: None,
            stalled_since: None,
            updated_at: now.timestamp(),
        });
        row.updated_at = now.timestamp();

        let mut newly_stalled = false;
        if success {
            row.failure_streak = 0;
        } else {
            row.failure_streak += 1;
            row.last_error = error.map(str::to_string);
            if row.failure_streak >= i64::from(self.stall_threshold) && row.stalled_since.is_none()
            {
                row.stalled_since = Some(now.timestamp());
                newly_stalled = true;
                warn!(
                    "Task {} stalled after {} consecutive failures: {}",
                    task_key,
                    row.failure_streak,
                    row.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        self.store.upsert_dead_letter(&row).await?;
        Ok(newly_stalled)
    }

    /// Operator action: drop all dead-letter state for a task so it can be
    /// scheduled again.
    pub async fn clear(&self, task_key: &str) -> Result<()> {
        self.store.delete_dead_letter(task_key).await?;
        info!("Dead-letter state cleared for {}", task_key);
        Ok(())
    }

    pub async fn stalled_tasks(&self) -> Result<Vec<DeadLetterRow>> {
        self.store.list_stalled().await
    }
}
