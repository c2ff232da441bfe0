//! Sticky network identity per wallet.
//!
//! A wallet keeps the same exit IP and browser fingerprint for the length
//! of a session window: faucet traffic rotates on a short window, RPC
//! traffic on a long one, user agents on their own clock. Proxy picks are
//! hash-anchored with a small random offset so assignments look stable but
//! not perfectly derivable from the wallet address.

use crate::config::SessionConfig;
use crate::entropy::EntropyScheduler;
use crate::error::TaskError;
use crate::store::{ProxyAssignmentRow, Store};
use crate::traits::RequestContext;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    Faucet,
    Rpc,
}

impl TrafficClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Faucet => "faucet",
            TrafficClass::Rpc => "rpc",
        }
    }
}

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
struct UaSession {
    user_agent: String,
    expires_at: DateTime<Utc>,
}

pub struct SessionBroker {
    store: Arc<Store>,
    config: SessionConfig,
    proxies: Vec<String>,
    user_agents: Vec<String>,
    ua_sessions: Mutex<HashMap<String, UaSession>>,
}

impl SessionBroker {
    pub fn new(
        store: Arc<Store>,
        config: SessionConfig,
        proxies: Vec<String>,
        user_agents: Vec<String>,
    ) -> Self {
        Self {
            store,
            config,
            proxies,
            user_agents,
            ua_sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sticky_hours(&self, class: TrafficClass) -> f64 {
        match class {
            TrafficClass::Faucet => self.config.faucet_ip_sticky_hours,
            TrafficClass::Rpc => self.config.rpc_ip_sticky_hours,
        }
    }

    /// Seeded RNG scoped to one stickiness window: every re-roll inside the
    /// same window draws identically, so assignments are reproducible.
    fn window_rng(wallet: &str, tag: &str, window_secs: i64, now: DateTime<Utc>) -> StdRng {
        let epoch = if window_secs > 0 {
            now.timestamp().div_euclid(window_secs)
        } else {
            0
        };
        EntropyScheduler::rng_for(&format!("{wallet}:{tag}"), epoch as u64)
    }

    /// Hash anchor into the proxy pool for one (wallet, class) pair.
    fn anchor_index(wallet: &str, class: TrafficClass, pool_len: usize) -> usize {
        let digest = Sha256::digest(format!("{}:{}", wallet, class.as_str()).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % pool_len as u64) as usize
    }

    /// Sticky proxy for a wallet's traffic class; lazily re-rolled when the
    /// stickiness window has passed or the stored proxy left the pool.
    pub async fn proxy_for(
        &self,
        wallet: &str,
        class: TrafficClass,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if self.proxies.is_empty() {
            return Ok(None);
        }

        if let Some(row) = self
            .store
            .get_proxy_assignment(wallet, class.as_str())
            .await?
        {
            if row.sticky_until > now.timestamp() && self.proxies.contains(&row.proxy_url) {
                return Ok(Some(row.proxy_url));
            }
        }

        let sticky_secs = (self.sticky_hours(class) * 3600.0).round() as i64;
        let anchor = Self::anchor_index(wallet, class, self.proxies.len());
        let mut rng = Self::window_rng(wallet, class.as_str(), sticky_secs, now);
        let offset = rng.gen_range(0..=self.config.proxy_offset_span);
        let proxy = self.proxies[(anchor + offset) % self.proxies.len()].clone();

        self.store
            .put_proxy_assignment(&ProxyAssignmentRow {
                wallet: wallet.to_string(),
                traffic_class: class.as_str().to_string(),
                proxy_url: proxy.clone(),
                sticky_until: (now + ChronoDuration::seconds(sticky_secs)).timestamp(),
            })
            .await?;

        debug!(
            "Assigned {} proxy for wallet {} ({}h sticky)",
            class.as_str(),
            wallet,
            self.sticky_hours(class)
        );
        Ok(Some(proxy))
    }

    /// Sticky user agent for a wallet; in-memory, re-rolled on expiry.
    pub fn user_agent_for(&self, wallet: &str, now: DateTime<Utc>) -> String {
        let mut sessions = match self.ua_sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(session) = sessions.get(wallet) {
            if session.expires_at > now {
                return session.user_agent.clone();
            }
        }

        let ttl_secs = (self.config.ua_session_hours * 3600.0).round() as i64;
        let ua = if self.user_agents.is_empty() {
            FALLBACK_USER_AGENT.to_string()
        } else {
            let mut rng = Self::window_rng(wallet, "ua", ttl_secs, now);
            let idx = rng.gen_range(0..self.user_agents.len());
            self.user_agents[idx].clone()
        };

        sessions.insert(
            wallet.to_string(),
            UaSession {
                user_agent: ua.clone(),
                expires_at: now + ChronoDuration::seconds(ttl_secs),
            },
        );
        ua
    }

    /// Full browser-shaped header set for faucet traffic.
    pub fn headers_for(&self, wallet: &str, now: DateTime<Utc>) -> Vec<(String, String)> {
        let ua = self.user_agent_for(wallet, now);
        vec![
            ("User-Agent".to_string(), ua),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ]
    }

    /// Assembles the network context a task executes under.
    pub async fn context_for(
        &self,
        wallet: &str,
        class: TrafficClass,
        now: DateTime<Utc>,
    ) -> Result<RequestContext, TaskError> {
        let proxy_url = self
            .proxy_for(wallet, class, now)
            .await
            .map_err(|e| TaskError::Other(format!("proxy assignment failed: {e}")))?;
        Ok(RequestContext {
            proxy_url,
            user_agent: self.user_agent_for(wallet, now),
            headers: self.headers_for(wallet, now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_index_is_stable_and_class_sensitive() {
        let a1 = SessionBroker::anchor_index("0xabc", TrafficClass::Faucet, 100);
        let a2 = SessionBroker::anchor_index("0xabc", TrafficClass::Faucet, 100);
        assert_eq!(a1, a2);

        // faucet and rpc hash differently for almost every wallet; spot-check
        // a handful so a single collision cannot fail the test
        let diverged = (0..16).any(|i| {
            let w = format!("0xwallet{i}");
            SessionBroker::anchor_index(&w, TrafficClass::Faucet, 1000)
                != SessionBroker::anchor_index(&w, TrafficClass::Rpc, 1000)
        });
        assert!(diverged);
    }

    #[test]
    fn window_rng_is_stable_within_a_window() {
        let now = Utc::now();
        let mut a = SessionBroker::window_rng("0xabc", "faucet", 7200, now);
        let mut b = SessionBroker::window_rng("0xabc", "faucet", 7200, now);
        assert_eq!(a.gen_range(0..1000u32), b.gen_range(0..1000u32));
    }

    #[test]
    fn window_rng_rerolls_across_windows() {
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(7200);
        let first: u32 = SessionBroker::window_rng("0xabc", "ua", 7200, now).gen_range(0..u32::MAX);
        // spot-check several subsequent windows; at least one must differ
        let changed = (1..8).any(|i| {
            let t = later + ChronoDuration::seconds(7200 * i);
            SessionBroker::window_rng("0xabc", "ua", 7200, t).gen_range(0..u32::MAX) != first
        });
        assert!(changed);
    }
}
