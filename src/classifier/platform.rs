//! Launch-platform detection
//!
//! One detector per external launch platform. Mint addresses minted through
//! a vanity-suffix launchpad carry that suffix; nothing else is inspected.

use serde::{Deserialize, Serialize};

use super::types::MarketPhase;

/// Launch platform a mint originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalPlatform {
    PumpFun,
    LetsBonk,
    Unknown,
}

const PUMP_FUN_SUFFIX: &str = "pump";
const LETS_BONK_SUFFIX: &str = "bonk";

impl ExternalPlatform {
    /// Detect the launch platform from a mint address
    pub fn detect(asset_id: &str) -> Self {
        let asset_id = asset_id.trim();
        if asset_id.len() <= PUMP_FUN_SUFFIX.len() {
            return ExternalPlatform::Unknown;
        }
        if asset_id.ends_with(PUMP_FUN_SUFFIX) {
            ExternalPlatform::PumpFun
        } else if asset_id.ends_with(LETS_BONK_SUFFIX) {
            ExternalPlatform::LetsBonk
        } else {
            ExternalPlatform::Unknown
        }
    }

    /// Whether the platform's own bonding curve can execute trades
    pub fn has_bonding_curve_venue(&self) -> bool {
        matches!(self, ExternalPlatform::PumpFun)
    }
}

/// Execution platform selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Pick per cycle from the detected launch platform and market phase
    Auto,
    /// Trade on the launch bonding curve
    BondingCurve,
    /// Route through the swap aggregator
    Aggregator,
}

impl Default for Platform {
    fn default() -> Self {
        Self::Auto
    }
}

impl Platform {
    /// Resolve `Auto` to a concrete venue
    pub fn resolve(self, asset_id: &str, phase: MarketPhase) -> Platform {
        match self {
            Platform::Auto => {
                if phase == MarketPhase::BondingCurve
                    && ExternalPlatform::detect(asset_id).has_bonding_curve_venue()
                {
                    Platform::BondingCurve
                } else {
                    Platform::Aggregator
                }
            }
            concrete => concrete,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Auto => write!(f, "auto"),
            Platform::BondingCurve => write!(f, "bonding_curve"),
            Platform::Aggregator => write!(f, "aggregator"),
        }
    }
}
