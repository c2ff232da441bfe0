//! # Configuration
//!
//! Serde-backed configuration for every scheduling component. Values load
//! from the environment (`.env` supported via `dotenv`) with hard errors on
//! malformed input; all knobs carry documented defaults so an empty
//! environment yields a working engine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// How jitter delays are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterDistribution {
    Uniform,
    Gaussian,
}

impl Default for JitterDistribution {
    fn default() -> Self {
        JitterDistribution::Uniform
    }
}

/// A named daily activity window, hours in local UTC `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaypartWindow {
    pub name: String,
    pub start_hour: u8,
    pub end_hour: u8,
}

/// Human-pattern scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Weekdays (0 = Monday) on which a wallet takes the whole day off.
    pub off_days: Vec<u32>,
    /// Hour ranges `[start, end)` treated as night lulls.
    pub night_lull_windows: Vec<(u8, u8)>,
    pub daypart_windows: Vec<DaypartWindow>,
    /// Probability of proceeding anyway during a weekend (1.0 - reduction).
    pub weekend_activity_reduction: f64,
    pub night_activity_reduction: f64,
    /// Over-cooldown slack bounds, fractions of the base cooldown.
    pub over_cooldown_jitter_min: f64,
    pub over_cooldown_jitter_max: f64,
    pub faucet_skip_probability: f64,
    pub action_skip_probability: f64,
    pub jitter_distribution: JitterDistribution,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            off_days: Vec::new(),
            night_lull_windows: vec![(0, 6), (22, 24)],
            daypart_windows: vec![
                DaypartWindow {
                    name: "morning".into(),
                    start_hour: 8,
                    end_hour: 12,
                },
                DaypartWindow {
                    name: "afternoon".into(),
                    start_hour: 13,
                    end_hour: 18,
                },
                DaypartWindow {
                    name: "evening".into(),
                    start_hour: 19,
                    end_hour: 22,
                },
            ],
            weekend_activity_reduction: 0.3,
            night_activity_reduction: 0.5,
            over_cooldown_jitter_min: 0.1,
            over_cooldown_jitter_max: 0.3,
            faucet_skip_probability: 0.05,
            action_skip_probability: 0.10,
            jitter_distribution: JitterDistribution::Uniform,
        }
    }
}

impl SchedulingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            weekend_activity_reduction: env_parse(
                "WEEKEND_ACTIVITY_REDUCTION",
                d.weekend_activity_reduction,
            )?,
            night_activity_reduction: env_parse(
                "NIGHT_ACTIVITY_REDUCTION",
                d.night_activity_reduction,
            )?,
            over_cooldown_jitter_min: env_parse(
                "OVER_COOLDOWN_JITTER_MIN",
                d.over_cooldown_jitter_min,
            )?,
            over_cooldown_jitter_max: env_parse(
                "OVER_COOLDOWN_JITTER_MAX",
                d.over_cooldown_jitter_max,
            )?,
            faucet_skip_probability: env_parse(
                "FAUCET_SKIP_PROBABILITY",
                d.faucet_skip_probability,
            )?,
            action_skip_probability: env_parse(
                "ACTION_SKIP_PROBABILITY",
                d.action_skip_probability,
            )?,
            ..d
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.over_cooldown_jitter_min > self.over_cooldown_jitter_max {
            return Err(ConfigError::InvalidValue {
                field: "over_cooldown_jitter_min".into(),
                reason: "must not exceed over_cooldown_jitter_max".into(),
            });
        }
        for p in [
            self.faucet_skip_probability,
            self.action_skip_probability,
            self.weekend_activity_reduction,
            self.night_activity_reduction,
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidValue {
                    field: "probability".into(),
                    reason: format!("{p} outside [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

/// Sticky session windows for IP and user-agent assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub faucet_ip_sticky_hours: f64,
    pub rpc_ip_sticky_hours: f64,
    pub ua_session_hours: f64,
    /// Random offset span applied on top of the hash-based proxy pick.
    pub proxy_offset_span: usize,
    /// Wallets per shard when the fleet is carved into IP cohorts.
    pub ip_shard_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            faucet_ip_sticky_hours: 2.0,
            rpc_ip_sticky_hours: 24.0,
            ua_session_hours: 12.0,
            proxy_offset_span: 3,
            ip_shard_size: 50,
        }
    }
}

/// Per-provider exponential backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each computed delay.
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_ms: 1_000,
        }
    }
}

/// Cohort-level auto-throttle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub error_threshold: f64,
    pub window: Duration,
    /// Outcomes required in the window before the threshold is consulted.
    pub min_samples: usize,
    pub base_pause: Duration,
    pub max_pause: Duration,
    pub slowdown_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.3,
            window: Duration::from_secs(300),
            min_samples: 10,
            base_pause: Duration::from_secs(600),
            max_pause: Duration::from_secs(3600),
            slowdown_factor: 2.0,
        }
    }
}

impl ThrottleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            error_threshold: env_parse("THROTTLE_ERROR_THRESHOLD", d.error_threshold)?,
            window: Duration::from_secs(env_parse(
                "THROTTLE_WINDOW_SECS",
                d.window.as_secs(),
            )?),
            min_samples: env_parse("THROTTLE_MIN_SAMPLES", d.min_samples)?,
            base_pause: Duration::from_secs(env_parse(
                "THROTTLE_BASE_PAUSE_SECS",
                d.base_pause.as_secs(),
            )?),
            max_pause: Duration::from_secs(env_parse(
                "THROTTLE_MAX_PAUSE_SECS",
                d.max_pause.as_secs(),
            )?),
            slowdown_factor: env_parse("THROTTLE_SLOWDOWN_FACTOR", d.slowdown_factor)?,
        })
    }
}

/// Worker pool bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            task_timeout: Duration::from_secs(60),
        }
    }
}

/// On-chain action scheduling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Hard per-wallet ceiling on successful actions per UTC day.
    pub daily_action_cap: u32,
    pub min_stake_balance: f64,
    /// Amount moved per action, in native units.
    pub action_amount: f64,
    pub action_cooldown_hours: u32,
    pub swap_from: String,
    pub swap_to: String,
    pub bridge_dest_chain: String,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            daily_action_cap: 6,
            min_stake_balance: 0.01,
            action_amount: 0.005,
            action_cooldown_hours: 8,
            swap_from: "native".into(),
            swap_to: "usdc".into(),
            bridge_dest_chain: "hub-testnet".into(),
        }
    }
}

impl ActionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(u64::from(self.action_cooldown_hours) * 3600)
    }
}

/// Driver cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub cycle_interval: Duration,
    /// Base pause between shards; jittered per shard boundary.
    pub shard_stagger: Duration,
    /// Consecutive real failures before a task is parked as stalled.
    pub stall_threshold: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(900),
            shard_stagger: Duration::from_secs(45),
            stall_threshold: 5,
        }
    }
}

/// How a faucet is driven: plain HTTP, or an external CLI tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Json,
    Form,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
}

/// One faucet endpoint. Closed enums keep unsupported combinations from
/// loading at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub chain: String,
    pub url: String,
    pub method: HttpMethod,
    pub payload_format: PayloadFormat,
    /// JSON/form field carrying the recipient address.
    pub address_field: String,
    pub cooldown_hours: u32,
    pub daily_limit: u32,
    pub captcha: Option<CaptchaKind>,
    pub site_key: Option<String>,
    /// Whether the endpoint expects a signed request from the wallet.
    #[serde(default)]
    pub requires_auth: bool,
    pub enabled: bool,
    /// Lower value is tried first within a chain.
    pub priority: u32,
}

impl ProviderConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(u64::from(self.cooldown_hours) * 3600)
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmConfig {
    pub scheduling: SchedulingConfig,
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    pub throttle: ThrottleConfig,
    pub pool: PoolConfig,
    pub actions: ActionConfig,
    pub driver: DriverConfig,
    pub providers: Vec<ProviderConfig>,
}

impl FarmConfig {
    /// Load from the environment. Reads `.env` once if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let cfg = Self {
            scheduling: SchedulingConfig::from_env()?,
            throttle: ThrottleConfig::from_env()?,
            ..Self::default()
        };
        cfg.scheduling.validate()?;
        Ok(cfg)
    }

    /// Loads the provider list from a JSON file.
    pub fn providers_from_file(path: &str) -> Result<Vec<ProviderConfig>, ConfigError> {
        if !std::path::Path::new(path).exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.to_string(),
            msg: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
            field: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Splits a flat (address, chain) fleet into IP-cohort shards of
    /// `session.ip_shard_size` wallets each, in input order.
    pub fn shard_wallets(
        &self,
        fleet: impl IntoIterator<Item = (String, String)>,
    ) -> Vec<crate::wallet::WalletRef> {
        fleet
            .into_iter()
            .enumerate()
            .map(|(i, (address, chain))| {
                let shard = crate::wallet::shard_for_index(i, self.session.ip_shard_size);
                crate::wallet::WalletRef::new(address, chain, shard)
            })
            .collect()
    }

    /// Enabled providers for a chain, ordered by ascending priority.
    pub fn providers_for_chain(&self, chain: &str) -> Vec<&ProviderConfig> {
        let mut out: Vec<&ProviderConfig> = self
            .providers
            .iter()
            .filter(|p| p.enabled && p.chain == chain)
            .collect();
        out.sort_by_key(|p| p.priority);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, chain: &str, priority: u32, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            chain: chain.into(),
            url: format!("https://faucet.test/{name}"),
            method: HttpMethod::Post,
            payload_format: PayloadFormat::Json,
            address_field: "address".into(),
            cooldown_hours: 24,
            daily_limit: 1,
            captcha: None,
            site_key: None,
            requires_auth: false,
            enabled,
            priority,
        }
    }

    #[test]
    fn providers_sorted_by_priority_and_filtered() {
        let cfg = FarmConfig {
            providers: vec![
                provider("slow", "sepolia", 5, true),
                provider("fast", "sepolia", 1, true),
                provider("off", "sepolia", 0, false),
                provider("other", "holesky", 1, true),
            ],
            ..FarmConfig::default()
        };
        let names: Vec<&str> = cfg
            .providers_for_chain("sepolia")
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["fast", "slow"]);
    }

    #[test]
    fn jitter_bounds_validated() {
        let mut s = SchedulingConfig::default();
        s.over_cooldown_jitter_min = 0.5;
        s.over_cooldown_jitter_max = 0.2;
        assert!(s.validate().is_err());
    }

    #[test]
    fn default_night_lulls_cover_late_and_early_hours() {
        let s = SchedulingConfig::default();
        assert_eq!(s.night_lull_windows, vec![(0, 6), (22, 24)]);
    }

    #[test]
    fn cli_driven_provider_parses() {
        let raw = r#"{
            "name": "hubfaucet",
            "chain": "hub-testnet",
            "url": "hubd tx faucet request",
            "method": "CLI",
            "payload_format": "json",
            "address_field": "address",
            "cooldown_hours": 12,
            "daily_limit": 1,
            "captcha": null,
            "site_key": null,
            "requires_auth": true,
            "enabled": true,
            "priority": 2
        }"#;
        let p: ProviderConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(p.method, HttpMethod::Cli);
        assert!(p.requires_auth);
    }

    #[test]
    fn requires_auth_defaults_to_false() {
        let raw = r#"{
            "name": "openfaucet",
            "chain": "sepolia",
            "url": "https://faucet.test",
            "method": "POST",
            "payload_format": "form",
            "address_field": "addr",
            "cooldown_hours": 24,
            "daily_limit": 2,
            "captcha": null,
            "site_key": null,
            "enabled": true,
            "priority": 1
        }"#;
        let p: ProviderConfig = serde_json::from_str(raw).unwrap();
        assert!(!p.requires_auth);
    }

    #[test]
    fn fleet_is_sharded_by_configured_size() {
        let mut cfg = FarmConfig::default();
        cfg.session.ip_shard_size = 2;
        let fleet = (0..5).map(|i| (format!("0x{i}"), "sepolia".to_string()));
        let wallets = cfg.shard_wallets(fleet);
        let shards: Vec<u32> = wallets.iter().map(|w| w.shard_id).collect();
        assert_eq!(shards, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn provider_file_must_exist() {
        let err = FarmConfig::providers_from_file("/nonexistent/providers.json");
        assert!(matches!(err, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn provider_file_loads_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");

        std::fs::write(&path, "[ not json").unwrap();
        let err = FarmConfig::providers_from_file(path.to_str().unwrap());
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));

        let body = serde_json::to_string(&vec![provider("fast", "sepolia", 1, true)]).unwrap();
        std::fs::write(&path, body).unwrap();
        let loaded = FarmConfig::providers_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "fast");
    }
}
