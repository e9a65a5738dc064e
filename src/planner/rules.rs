//! Plan safety rules
//!
//! Rules are checked before any allocation happens. Violations are returned
//! as a list; a plan with any violation carries zero transactions.

use serde::{Deserialize, Serialize};

/// Rules snapshot assembled for one planning cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRules {
    /// Maximum wallets a plan may use (initial wallet count)
    pub max_wallets: usize,
    /// Default per-cycle volume before strategy scaling (SOL)
    pub base_volume: f64,
    /// Hard per-cycle volume cap (SOL)
    pub max_volume: f64,
    /// Lowest tolerated session PnL (SOL, usually negative)
    pub min_profit_sol: Option<f64>,
    /// Maximum tolerated session loss relative to spend (%)
    pub max_session_loss_pct: Option<f64>,
    /// Maximum tolerated drop from the session price high (%)
    pub max_price_drop_pct: Option<f64>,
    /// Session PnL so far (SOL)
    pub session_pnl_sol: f64,
    /// Total SOL spent on buys so far
    pub session_spent_sol: f64,
    /// Session price high, if any price was observed
    pub price_high: Option<f64>,
    /// Latest observed price
    pub current_price: Option<f64>,
}

impl Default for PlanRules {
    fn default() -> Self {
        Self {
            max_wallets: 10,
            base_volume: 0.1,
            max_volume: 0.5,
            min_profit_sol: None,
            max_session_loss_pct: None,
            max_price_drop_pct: None,
            session_pnl_sol: 0.0,
            session_spent_sol: 0.0,
            price_high: None,
            current_price: None,
        }
    }
}

/// A violated safety rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleViolation {
    WalletCountExceeded { requested: usize, max: usize },
    VolumeCapExceeded { requested: f64, max: f64 },
    ProfitFloorBreached { pnl_sol: f64, floor_sol: f64 },
    LossCeilingBreached { loss_pct: f64, max_pct: f64 },
    PriceDropExceeded { drop_pct: f64, max_pct: f64 },
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::WalletCountExceeded { requested, max } => {
                write!(f, "{} wallets requested, max {}", requested, max)
            }
            RuleViolation::VolumeCapExceeded { requested, max } => {
                write!(f, "volume {} SOL exceeds cap {} SOL", requested, max)
            }
            RuleViolation::ProfitFloorBreached { pnl_sol, floor_sol } => {
                write!(f, "session PnL {:.4} SOL below floor {} SOL", pnl_sol, floor_sol)
            }
            RuleViolation::LossCeilingBreached { loss_pct, max_pct } => {
                write!(f, "session loss {:.2}% exceeds ceiling {}%", loss_pct, max_pct)
            }
            RuleViolation::PriceDropExceeded { drop_pct, max_pct } => {
                write!(f, "price drop {:.2}% exceeds max {}%", drop_pct, max_pct)
            }
        }
    }
}

impl PlanRules {
    /// Check every rule and collect all violations
    pub fn validate(&self, wallet_count: usize, volume: f64) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        if wallet_count > self.max_wallets {
            violations.push(RuleViolation::WalletCountExceeded {
                requested: wallet_count,
                max: self.max_wallets,
            });
        }

        if volume > self.max_volume {
            violations.push(RuleViolation::VolumeCapExceeded {
                requested: volume,
                max: self.max_volume,
            });
        }

        if let Some(floor) = self.min_profit_sol {
            if self.session_pnl_sol < floor {
                violations.push(RuleViolation::ProfitFloorBreached {
                    pnl_sol: self.session_pnl_sol,
                    floor_sol: floor,
                });
            }
        }

        if let Some(max_loss) = self.max_session_loss_pct {
            let loss_pct = self.session_loss_pct();
            if loss_pct >= max_loss {
                violations.push(RuleViolation::LossCeilingBreached {
                    loss_pct,
                    max_pct: max_loss,
                });
            }
        }

        if let Some(max_drop) = self.max_price_drop_pct {
            if let Some(drop_pct) = self.price_drop_pct() {
                if drop_pct >= max_drop {
                    violations.push(RuleViolation::PriceDropExceeded {
                        drop_pct,
                        max_pct: max_drop,
                    });
                }
            }
        }

        violations
    }

    /// Loss as a percentage of SOL spent (0 when in profit or nothing spent)
    pub fn session_loss_pct(&self) -> f64 {
        if self.session_spent_sol <= 0.0 || self.session_pnl_sol >= 0.0 {
            return 0.0;
        }
        (-self.session_pnl_sol / self.session_spent_sol) * 100.0
    }

    /// Drop from the session high to the current price (%)
    pub fn price_drop_pct(&self) -> Option<f64> {
        match (self.price_high, self.current_price) {
            (Some(high), Some(current)) if high > 0.0 && current < high => {
                Some((high - current) / high * 100.0)
            }
            (Some(_), Some(_)) => Some(0.0),
            _ => None,
        }
    }
}
