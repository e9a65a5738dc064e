//! Shared types for market classification
//!
//! Phase, protocol state and strategy enums plus the metrics shapes the
//! classifier consumes and produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// Where the asset currently trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    /// Pre-migration: priced by the launch bonding curve
    BondingCurve,
    /// Post-migration: priced by an AMM pool
    Amm,
}

impl std::fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketPhase::BondingCurve => write!(f, "bonding_curve"),
            MarketPhase::Amm => write!(f, "amm"),
        }
    }
}

/// Protocol state derived from price/volume/liquidity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// Price rising with real volume and holder base
    Momentum,
    /// Price falling or liquidity thin
    Stabilizing,
    /// Healthy supply and liquidity to capture spread
    Capturing,
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolState::Momentum => write!(f, "momentum"),
            ProtocolState::Stabilizing => write!(f, "stabilizing"),
            ProtocolState::Capturing => write!(f, "capturing"),
        }
    }
}

/// Allocation strategy recommended to the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Randomized entry/exit slices
    Bullish,
    /// Even liquidity provision, balanced buy/sell
    Defensive,
    /// Paired arbitrage buy/sell legs
    Arbitrage,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Bullish
    }
}

impl Strategy {
    /// Multiplier applied to the base volume when no explicit volume is given
    pub fn volume_multiplier(&self) -> f64 {
        match self {
            Strategy::Bullish => 1.0,
            Strategy::Defensive => 1.5,
            Strategy::Arbitrage => 2.0,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Bullish => write!(f, "bullish"),
            Strategy::Defensive => write!(f, "defensive"),
            Strategy::Arbitrage => write!(f, "arbitrage"),
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" => Ok(Strategy::Bullish),
            "defensive" => Ok(Strategy::Defensive),
            "arbitrage" => Ok(Strategy::Arbitrage),
            other => Err(Error::Validation(format!("Unknown strategy: {}", other))),
        }
    }
}

/// Raw metrics as delivered by a market-data source
///
/// Every field is optional; missing values normalize to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetrics {
    #[serde(default, alias = "price_sol")]
    pub price: Option<f64>,
    #[serde(default, alias = "price_change_pct", alias = "priceChange")]
    pub price_change_pct: Option<f64>,
    #[serde(default, alias = "volume_24h", alias = "volume24h")]
    pub volume: Option<f64>,
    #[serde(default, alias = "holder_count", alias = "holders")]
    pub holder_count: Option<u64>,
    #[serde(default)]
    pub liquidity: Option<f64>,
    #[serde(default, alias = "circulating_supply")]
    pub circulating_supply: Option<f64>,
    #[serde(default, alias = "total_supply")]
    pub total_supply: Option<f64>,
    #[serde(default, alias = "market_cap", alias = "marketCapSol")]
    pub market_cap: Option<f64>,
    #[serde(default, alias = "bonding_progress_pct", alias = "bondingCurveProgress")]
    pub bonding_progress_pct: Option<f64>,
    #[serde(default, alias = "complete")]
    pub migrated: Option<bool>,
}

/// Fixed-shape metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub price: f64,
    pub price_change_pct: f64,
    pub volume: f64,
    pub holder_count: u64,
    pub liquidity: f64,
    pub circulating_supply: f64,
    pub total_supply: f64,
    pub market_cap: f64,
    pub bonding_progress_pct: f64,
    pub migrated: bool,
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

impl From<&RawMetrics> for MetricsSnapshot {
    fn from(raw: &RawMetrics) -> Self {
        Self {
            price: finite_or_zero(raw.price).max(0.0),
            price_change_pct: finite_or_zero(raw.price_change_pct),
            volume: finite_or_zero(raw.volume).max(0.0),
            holder_count: raw.holder_count.unwrap_or(0),
            liquidity: finite_or_zero(raw.liquidity).max(0.0),
            circulating_supply: finite_or_zero(raw.circulating_supply).max(0.0),
            total_supply: finite_or_zero(raw.total_supply).max(0.0),
            market_cap: finite_or_zero(raw.market_cap).max(0.0),
            bonding_progress_pct: finite_or_zero(raw.bonding_progress_pct).clamp(0.0, 100.0),
            migrated: raw.migrated.unwrap_or(false),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of total supply in circulation (0 when supply unknown)
    pub fn supply_ratio(&self) -> f64 {
        if self.total_supply <= 0.0 {
            return 0.0;
        }
        (self.circulating_supply / self.total_supply).clamp(0.0, 1.0)
    }
}

/// Classifier thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Forced phase override (wins over metrics)
    #[serde(default)]
    pub force_phase: Option<MarketPhase>,
    /// Minimum windowed price rise for momentum (%)
    #[serde(default = "default_momentum_price_change_pct")]
    pub momentum_price_change_pct: f64,
    /// Minimum volume for momentum
    #[serde(default = "default_momentum_min_volume")]
    pub momentum_min_volume: f64,
    /// Minimum holders for momentum
    #[serde(default = "default_momentum_min_holders")]
    pub momentum_min_holders: u64,
    /// Price drop that forces stabilizing (%)
    #[serde(default = "default_stabilizing_price_drop_pct")]
    pub stabilizing_price_drop_pct: f64,
    /// Liquidity floor below which the market is stabilizing
    #[serde(default = "default_liquidity_floor")]
    pub liquidity_floor: f64,
    /// Minimum circulating/total supply ratio for capturing
    #[serde(default = "default_capture_min_supply_ratio")]
    pub capture_min_supply_ratio: f64,
    /// Minimum liquidity for capturing
    #[serde(default = "default_capture_min_liquidity")]
    pub capture_min_liquidity: f64,
    /// Emit at least this often even when nothing changed
    #[serde(default = "default_emit_interval_ms")]
    pub emit_interval_ms: u64,
}

fn default_momentum_price_change_pct() -> f64 { 5.0 }
fn default_momentum_min_volume() -> f64 { 1.0 }
fn default_momentum_min_holders() -> u64 { 50 }
fn default_stabilizing_price_drop_pct() -> f64 { 10.0 }
fn default_liquidity_floor() -> f64 { 5.0 }
fn default_capture_min_supply_ratio() -> f64 { 0.5 }
fn default_capture_min_liquidity() -> f64 { 20.0 }
fn default_emit_interval_ms() -> u64 { 30_000 }

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            force_phase: None,
            momentum_price_change_pct: default_momentum_price_change_pct(),
            momentum_min_volume: default_momentum_min_volume(),
            momentum_min_holders: default_momentum_min_holders(),
            stabilizing_price_drop_pct: default_stabilizing_price_drop_pct(),
            liquidity_floor: default_liquidity_floor(),
            capture_min_supply_ratio: default_capture_min_supply_ratio(),
            capture_min_liquidity: default_capture_min_liquidity(),
            emit_interval_ms: default_emit_interval_ms(),
        }
    }
}

/// Derived classification snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierStatus {
    pub asset_id: String,
    pub phase: MarketPhase,
    pub protocol_state: ProtocolState,
    pub strategy: Strategy,
    pub metrics: MetricsSnapshot,
    pub config: ClassifierConfig,
    pub timestamp: DateTime<Utc>,
}

impl ClassifierStatus {
    /// True if phase, state or strategy differ from `other`
    pub fn materially_differs(&self, other: &ClassifierStatus) -> bool {
        self.phase != other.phase
            || self.protocol_state != other.protocol_state
            || self.strategy != other.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Bullish".parse::<Strategy>().unwrap(), Strategy::Bullish);
        assert_eq!(" defensive ".parse::<Strategy>().unwrap(), Strategy::Defensive);
        assert!(matches!(
            "moonshot".parse::<Strategy>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_raw_metrics_normalization() {
        let json = r#"{
            "price": 0.000031,
            "priceChange": 12.5,
            "volume24h": 40.0,
            "holders": 120,
            "liquidity": null,
            "complete": true
        }"#;
        let raw: RawMetrics = serde_json::from_str(json).unwrap();
        let snapshot = MetricsSnapshot::from(&raw);

        assert_eq!(snapshot.holder_count, 120);
        assert_eq!(snapshot.liquidity, 0.0);
        assert!((snapshot.price_change_pct - 12.5).abs() < 1e-9);
        assert!(snapshot.migrated);
    }

    #[test]
    fn test_non_finite_metrics_become_zero() {
        let raw = RawMetrics {
            price: Some(f64::NAN),
            volume: Some(f64::INFINITY),
            ..Default::default()
        };
        let snapshot = MetricsSnapshot::from(&raw);
        assert_eq!(snapshot.price, 0.0);
        assert_eq!(snapshot.volume, 0.0);
    }

    #[test]
    fn test_supply_ratio() {
        let snapshot = MetricsSnapshot {
            circulating_supply: 600.0,
            total_supply: 1000.0,
            ..Default::default()
        };
        assert!((snapshot.supply_ratio() - 0.6).abs() < 1e-9);
        assert_eq!(MetricsSnapshot::default().supply_ratio(), 0.0);
    }
}
