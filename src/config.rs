//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::ClassifierConfig;
use crate::executor::fees::FeeSchedule;
use crate::executor::ExecutorConfig;
use crate::session::{SessionManagerConfig, SessionSettings};
use crate::stream::StreamConfig;
use crate::venue::aggregator::AggregatorVenueConfig;
use crate::venue::bonding_curve::BondingCurveVenueConfig;

lazy_static::lazy_static! {
    static ref BASE58_ADDRESS: regex::Regex =
        regex::Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("static regex");
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub venues: VenuesConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Defaults for sessions started without explicit settings
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rpc_endpoint(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuesConfig {
    /// Local-transaction API for the bonding curve
    #[serde(default = "default_bonding_curve_api_url")]
    pub bonding_curve_api_url: String,
    #[serde(default = "default_aggregator_api_url")]
    pub aggregator_api_url: String,
    #[serde(default = "default_priority_fee_sol")]
    pub priority_fee_sol: f64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Default for VenuesConfig {
    fn default() -> Self {
        Self {
            bonding_curve_api_url: default_bonding_curve_api_url(),
            aggregator_api_url: default_aggregator_api_url(),
            priority_fee_sol: default_priority_fee_sol(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl VenuesConfig {
    pub fn bonding_curve(&self) -> BondingCurveVenueConfig {
        BondingCurveVenueConfig {
            api_url: self.bonding_curve_api_url.clone(),
            priority_fee_sol: self.priority_fee_sol,
            http_timeout: Duration::from_millis(self.http_timeout_ms),
        }
    }

    pub fn aggregator(&self) -> AggregatorVenueConfig {
        AggregatorVenueConfig {
            api_url: self.aggregator_api_url.clone(),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
        }
    }
}

/// Platform fee collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeesConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Receives the platform share
    #[serde(default)]
    pub fee_wallet: String,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u16,
    #[serde(default = "default_referrer_share_pct")]
    pub referrer_share_pct: f64,
    #[serde(default = "default_min_fee_lamports")]
    pub min_fee_lamports: u64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fee_wallet: String::new(),
            fee_bps: default_fee_bps(),
            referrer_share_pct: default_referrer_share_pct(),
            min_fee_lamports: default_min_fee_lamports(),
        }
    }
}

impl FeesConfig {
    pub fn schedule(&self) -> FeeSchedule {
        FeeSchedule {
            fee_bps: self.fee_bps,
            referrer_share_pct: self.referrer_share_pct,
            min_fee_lamports: self.min_fee_lamports,
        }
    }
}

/// Session manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Run the stream-fed risk monitor for sessions with risk enabled
    #[serde(default = "default_true")]
    pub monitor_risk: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            event_capacity: default_event_capacity(),
            monitor_risk: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    /// Directory holding wallets.json and the keypair files
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            data_dir: default_data_dir(),
        }
    }
}

// Default value functions
fn default_rpc_endpoint() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_bonding_curve_api_url() -> String {
    BondingCurveVenueConfig::default().api_url
}
fn default_aggregator_api_url() -> String {
    AggregatorVenueConfig::default().api_url
}
fn default_priority_fee_sol() -> f64 {
    0.0005
}
fn default_http_timeout_ms() -> u64 {
    10_000
}
fn default_fee_bps() -> u16 {
    100
}
fn default_referrer_share_pct() -> f64 {
    20.0
}
fn default_min_fee_lamports() -> u64 {
    5_000
}
fn default_lease_ttl_secs() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_credentials_dir() -> PathBuf {
    PathBuf::from("credentials")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix VOLUME_)
            .add_source(
                config::Environment::with_prefix("VOLUME")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.rpc.timeout_ms == 0 {
            anyhow::bail!("rpc.timeout_ms must be positive");
        }

        if !self.stream.ws_url.starts_with("ws://") && !self.stream.ws_url.starts_with("wss://") {
            anyhow::bail!("stream.ws_url must be a ws:// or wss:// URL, got {}", self.stream.ws_url);
        }

        if self.venues.priority_fee_sol < 0.0 {
            anyhow::bail!("venues.priority_fee_sol cannot be negative");
        }

        if self.fees.enabled {
            if !is_base58_address(&self.fees.fee_wallet) {
                anyhow::bail!("Invalid fees.fee_wallet address: {:?}", self.fees.fee_wallet);
            }
            if self.fees.fee_bps > 10_000 {
                anyhow::bail!("fees.fee_bps cannot exceed 10000 (100%)");
            }
            if !(0.0..=100.0).contains(&self.fees.referrer_share_pct) {
                anyhow::bail!("fees.referrer_share_pct must be between 0 and 100");
            }
        }

        if self.manager.lease_ttl_secs == 0 {
            anyhow::bail!("manager.lease_ttl_secs must be positive");
        }

        if let Some(referrer) = &self.session.referrer {
            if !is_base58_address(referrer) {
                anyhow::bail!("Invalid session.referrer address: {}", referrer);
            }
        }

        self.session
            .validate()
            .context("Invalid default session settings")?;

        if self.session.risk.enabled && !self.manager.monitor_risk {
            tracing::warn!("Risk settings enabled but manager.monitor_risk is off, triggers will not fire");
        }

        Ok(())
    }

    /// Session manager configuration derived from this file
    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            lease_ttl_secs: self.manager.lease_ttl_secs,
            event_capacity: self.manager.event_capacity,
            monitor_risk: self.manager.monitor_risk,
            stream: self.stream.clone(),
            default_settings: self.session.clone(),
        }
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  RPC:
    endpoint: {}
    timeout: {}ms
  Stream:
    ws_url: {}
    max_reconnect_attempts: {}
  Venues:
    bonding_curve_api: {}
    aggregator_api: {}
    priority_fee: {} SOL
  Fees:
    enabled: {}
    fee_wallet: {}
    fee: {}bps (referrer share {}%)
  Session defaults:
    volume: {} - {} SOL (base {})
    target_volume: {} SOL
    interval: {}s
    wallet_count: {}
    rotation: {:?}
    platform: {}
    slippage: {}bps
    risk_monitoring: {}
  Custody:
    credentials_dir: {}
  Persistence:
    store: {:?}
    data_dir: {}
"#,
            mask_url(&self.rpc.endpoint),
            self.rpc.timeout_ms,
            mask_url(&self.stream.ws_url),
            self.stream.max_reconnect_attempts,
            mask_url(&self.venues.bonding_curve_api_url),
            mask_url(&self.venues.aggregator_api_url),
            self.venues.priority_fee_sol,
            self.fees.enabled,
            if self.fees.fee_wallet.is_empty() {
                "(not set)".to_string()
            } else {
                mask_address(&self.fees.fee_wallet)
            },
            self.fees.fee_bps,
            self.fees.referrer_share_pct,
            self.session.min_volume_sol,
            self.session.max_volume_sol,
            self.session.base_volume_sol,
            self.session.target_volume_sol,
            self.session.trade_interval_secs,
            self.session.wallet_count,
            self.session.rotation_mode,
            self.session.platform,
            self.session.slippage_bps,
            self.session.risk.enabled,
            self.custody.credentials_dir.display(),
            self.persistence.store,
            self.persistence.data_dir.display(),
        )
    }
}

fn is_base58_address(address: &str) -> bool {
    BASE58_ADDRESS.is_match(address)
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

fn mask_address(address: &str) -> String {
    if address.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &address[..4], &address[address.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.fees.enabled);
        assert_eq!(config.persistence.store, StoreKind::File);
        assert_eq!(config.manager.lease_ttl_secs, 300);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[rpc]
endpoint = "https://rpc.example.com?api-key=secret"

[session]
target_volume_sol = 25.0
wallet_count = 4
rotation_mode = "round_robin"

[persistence]
store = "memory"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.session.target_volume_sol, 25.0);
        assert_eq!(config.session.wallet_count, 4);
        assert_eq!(config.persistence.store, StoreKind::Memory);
        assert_eq!(config.rpc.timeout_ms, 10_000);

        let manager = config.manager_config();
        assert_eq!(manager.default_settings.wallet_count, 4);

        let display = config.masked_display();
        assert!(display.contains("https://rpc.example.com?***"));
        assert!(!display.contains("secret"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.rpc.endpoint, default_rpc_endpoint());
    }

    #[test]
    fn test_fees_require_valid_wallet() {
        let mut config = Config::default();
        config.fees.enabled = true;
        config.fees.fee_wallet = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.fees.fee_wallet = "11111111111111111111111111111111".to_string();
        assert!(config.validate().is_ok());

        config.fees.fee_bps = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_session_defaults_rejected() {
        let mut config = Config::default();
        config.session.min_volume_sol = 1.0;
        config.session.max_volume_sol = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn test_mask_address() {
        assert_eq!(
            mask_address("So11111111111111111111111111111111111111112"),
            "So11...1112"
        );
        assert_eq!(mask_address("short"), "***");
    }
}
