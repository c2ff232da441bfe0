//! Day-bucketed duplicate-dispatch suppression.
//!
//! The key is `hex(sha256("provider:wallet:chain:YYYY-MM-DD"))`; the claim
//! is a single `INSERT OR IGNORE` against a UNIQUE column, so concurrent
//! dispatchers race safely inside SQLite and exactly one wins.

use crate::ledger::day_bucket;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub struct IdempotencyGuard {
    store: Arc<Store>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Canonical key for one (provider, wallet, chain) per UTC day.
    pub fn key_for(provider: &str, wallet: &str, chain: &str, at: DateTime<Utc>) -> String {
        let material = format!("{}:{}:{}:{}", provider, wallet, chain, day_bucket(at));
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// True when this caller won the claim; false when the key was already
    /// taken this day.
    pub async fn try_claim(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        self.store
            .try_insert_idempotency_key(key, now.timestamp())
            .await
    }

    /// Undo a claim whose dispatch failed before any external side effect,
    /// so a later cycle can retry within the same day bucket.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.store.release_idempotency_key(key).await
    }
}
